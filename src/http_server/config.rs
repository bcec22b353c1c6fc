//! HTTP Server Configuration
//!
//! Bind address, CORS origins for the admin API, and the mount points of
//! the invocation and admin routers.

use serde::{Deserialize, Serialize};

use crate::functions::proxy::DEFAULT_PREFIX;

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpServerConfig {
    /// Host to bind to (default: "0.0.0.0")
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to (default: 54321)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Admin API CORS origins; empty allows any origin
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Invocation mount point (default: "/functions/v1")
    #[serde(default = "default_functions_prefix")]
    pub functions_prefix: String,

    /// Admin API mount point (default: "/admin/v1")
    #[serde(default = "default_admin_prefix")]
    pub admin_prefix: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    54321
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".to_string(), // Vite dev server
        "http://localhost:3000".to_string(),
        "http://127.0.0.1:5173".to_string(),
    ]
}

fn default_functions_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_admin_prefix() -> String {
    "/admin/v1".to_string()
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
            functions_prefix: default_functions_prefix(),
            admin_prefix: default_admin_prefix(),
        }
    }
}

impl HttpServerConfig {
    /// Create a new config with specified port
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Get the socket address string
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Mount points must be absolute, distinct, and not the root
    pub fn validate(&self) -> Result<(), String> {
        for (label, prefix) in [
            ("functions_prefix", &self.functions_prefix),
            ("admin_prefix", &self.admin_prefix),
        ] {
            if !prefix.starts_with('/') || prefix.len() < 2 || prefix.ends_with('/') {
                return Err(format!(
                    "{} must start with '/', not end with '/', and not be the root: '{}'",
                    label, prefix
                ));
            }
        }
        if self.functions_prefix == self.admin_prefix {
            return Err("functions_prefix and admin_prefix must differ".to_string());
        }
        if self.port == 0 {
            return Err("server port must be > 0".to_string());
        }
        Ok(())
    }
}
