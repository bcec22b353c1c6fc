//! Configuration file
//!
//! JSON, every section optional:
//!
//! ```json
//! {
//!   "server":    { "host": "0.0.0.0", "port": 54321 },
//!   "functions": { "dir": "./functions" },
//!   "runtime":   { "port": 8081, "version": "1.67.4", "auto_download": true },
//!   "store":     { "path": "./data/edgeplane.db" },
//!   "auth":      { "jwt_secret": "..." },
//!   "supabase":  { "url": "http://127.0.0.1:54321", "anon_key": "..." }
//! }
//! ```
//!
//! `EDGEPLANE_JWT_SECRET`, `EDGEPLANE_ANON_KEY` and
//! `EDGEPLANE_SERVICE_ROLE_KEY` override the file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{CliError, CliResult};
use crate::auth::JwtValidator;
use crate::functions::downloader;
use crate::functions::runtime::{
    RuntimeConfig, DEFAULT_HEALTH_INTERVAL, DEFAULT_POLL_INTERVAL, DEFAULT_PORT,
    DEFAULT_STARTUP_TIMEOUT, DEFAULT_STOP_TIMEOUT, WELL_KNOWN_PATHS,
};
use crate::http_server::HttpServerConfig;

pub const ENV_JWT_SECRET: &str = "EDGEPLANE_JWT_SECRET";
pub const ENV_ANON_KEY: &str = "EDGEPLANE_ANON_KEY";
pub const ENV_SERVICE_ROLE_KEY: &str = "EDGEPLANE_SERVICE_ROLE_KEY";

/// HS256 secrets shorter than this are rejected
pub const MIN_JWT_SECRET_LEN: usize = 32;

/// Lifetime of keys minted when none are configured
const MINTED_KEY_DAYS: i64 = 3650;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: HttpServerConfig,
    #[serde(default)]
    pub functions: FunctionsSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub supabase: SupabaseSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionsSection {
    /// Root directory holding one subdirectory per function
    #[serde(default = "default_functions_dir")]
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSection {
    #[serde(default = "default_runtime_host")]
    pub host: String,
    #[serde(default = "default_runtime_port")]
    pub port: u16,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_base_url")]
    pub download_base_url: String,
    /// Extra SHA-256 pins keyed `"<os>-<arch>"`
    #[serde(default)]
    pub checksums: HashMap<String, String>,
    #[serde(default)]
    pub binary_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub auto_download: bool,
    /// Download releases with no pin for the host platform, unverified
    #[serde(default)]
    pub allow_unpinned_download: bool,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// SQLite database file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    /// Signs invocation tokens and keys the secret cipher
    #[serde(default)]
    pub jwt_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseSection {
    #[serde(default = "default_supabase_url")]
    pub url: String,
    #[serde(default)]
    pub anon_key: String,
    #[serde(default)]
    pub service_role_key: String,
    #[serde(default)]
    pub db_url: String,
}

fn default_functions_dir() -> PathBuf {
    PathBuf::from("./functions")
}
fn default_runtime_host() -> String {
    "127.0.0.1".to_string()
}
fn default_runtime_port() -> u16 {
    DEFAULT_PORT
}
fn default_version() -> String {
    downloader::DEFAULT_VERSION.to_string()
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("./data/bin")
}
fn default_base_url() -> String {
    downloader::DEFAULT_BASE_URL.to_string()
}
fn default_true() -> bool {
    true
}
fn default_startup_timeout_ms() -> u64 {
    DEFAULT_STARTUP_TIMEOUT.as_millis() as u64
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}
fn default_health_interval_ms() -> u64 {
    DEFAULT_HEALTH_INTERVAL.as_millis() as u64
}
fn default_stop_timeout_ms() -> u64 {
    DEFAULT_STOP_TIMEOUT.as_millis() as u64
}
fn default_store_path() -> PathBuf {
    PathBuf::from("./data/edgeplane.db")
}
fn default_supabase_url() -> String {
    "http://127.0.0.1:54321".to_string()
}

impl Default for FunctionsSection {
    fn default() -> Self {
        Self {
            dir: default_functions_dir(),
        }
    }
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            host: default_runtime_host(),
            port: default_runtime_port(),
            version: default_version(),
            download_dir: default_download_dir(),
            download_base_url: default_base_url(),
            checksums: HashMap::new(),
            binary_path: None,
            auto_download: true,
            allow_unpinned_download: false,
            startup_timeout_ms: default_startup_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            health_interval_ms: default_health_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for SupabaseSection {
    fn default() -> Self {
        Self {
            url: default_supabase_url(),
            anon_key: String::new(),
            service_role_key: String::new(),
            db_url: String::new(),
        }
    }
}

impl Config {
    /// Load configuration from file, apply environment overrides, validate
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::config_error(format!("Failed to read config: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| CliError::config_error(format!("Invalid config JSON: {}", e)))?;

        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;

        Ok(config)
    }

    /// Non-empty values from `lookup` replace the file's
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let pick = |name: &str| lookup(name).filter(|v| !v.is_empty());
        if let Some(v) = pick(ENV_JWT_SECRET) {
            self.auth.jwt_secret = v;
        }
        if let Some(v) = pick(ENV_ANON_KEY) {
            self.supabase.anon_key = v;
        }
        if let Some(v) = pick(ENV_SERVICE_ROLE_KEY) {
            self.supabase.service_role_key = v;
        }
    }

    pub fn validate(&self) -> CliResult<()> {
        self.server
            .validate()
            .map_err(|e| CliError::config_error(format!("server: {}", e)))?;

        if self.auth.jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(CliError::config_error(format!(
                "auth.jwt_secret must be at least {} characters (or set {})",
                MIN_JWT_SECRET_LEN, ENV_JWT_SECRET
            )));
        }

        let runtime = &self.runtime;
        if runtime.port == 0 {
            return Err(CliError::config_error("runtime.port must be > 0"));
        }
        if runtime.host == self.server.host && runtime.port == self.server.port {
            return Err(CliError::config_error(
                "runtime and server cannot listen on the same address",
            ));
        }
        if runtime.version.trim().is_empty() {
            return Err(CliError::config_error("runtime.version must not be empty"));
        }
        for (label, value) in [
            ("startup_timeout_ms", runtime.startup_timeout_ms),
            ("poll_interval_ms", runtime.poll_interval_ms),
            ("health_interval_ms", runtime.health_interval_ms),
            ("stop_timeout_ms", runtime.stop_timeout_ms),
        ] {
            if value == 0 {
                return Err(CliError::config_error(format!(
                    "runtime.{} must be > 0",
                    label
                )));
            }
        }
        for (platform, digest) in &runtime.checksums {
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(CliError::config_error(format!(
                    "runtime.checksums.{} is not a SHA-256 hex digest",
                    platform
                )));
            }
        }

        Ok(())
    }

    /// Fill in anon and service-role keys signed with the JWT secret when
    /// the configuration leaves them empty
    pub fn mint_missing_keys(&mut self) -> CliResult<()> {
        let validator = JwtValidator::new(&self.auth.jwt_secret);
        let ttl = chrono::Duration::days(MINTED_KEY_DAYS);
        let mint = |role: &str| {
            validator
                .issue(role, ttl)
                .map_err(|e| CliError::config_error(format!("cannot mint {} key: {}", role, e)))
        };

        if self.supabase.anon_key.is_empty() {
            self.supabase.anon_key = mint("anon")?;
        }
        if self.supabase.service_role_key.is_empty() {
            self.supabase.service_role_key = mint("service_role")?;
        }
        Ok(())
    }

    pub fn to_runtime_config(&self) -> RuntimeConfig {
        let runtime = &self.runtime;
        RuntimeConfig {
            functions_dir: self.functions.dir.clone(),
            host: runtime.host.clone(),
            port: runtime.port,
            version: runtime.version.clone(),
            download_dir: runtime.download_dir.clone(),
            download_base_url: runtime.download_base_url.clone(),
            checksums: runtime.checksums.clone(),
            binary_path: runtime.binary_path.clone(),
            search_paths: WELL_KNOWN_PATHS.iter().map(PathBuf::from).collect(),
            auto_download: runtime.auto_download,
            allow_unpinned_download: runtime.allow_unpinned_download,
            supabase_url: self.supabase.url.clone(),
            anon_key: self.supabase.anon_key.clone(),
            service_role_key: self.supabase.service_role_key.clone(),
            db_url: self.supabase.db_url.clone(),
            secrets: HashMap::new(),
            startup_timeout: Duration::from_millis(runtime.startup_timeout_ms),
            poll_interval: Duration::from_millis(runtime.poll_interval_ms),
            health_interval: Duration::from_millis(runtime.health_interval_ms),
            stop_timeout: Duration::from_millis(runtime.stop_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn write_config(dir: &TempDir, value: serde_json::Value) -> PathBuf {
        let path = dir.path().join("edgeplane.json");
        fs::write(&path, value.to_string()).unwrap();
        path
    }

    #[test]
    fn test_config_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, json!({ "auth": { "jwt_secret": SECRET } }));

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 54321);
        assert_eq!(config.runtime.port, 8081);
        assert!(config.runtime.auto_download);
        assert!(!config.runtime.allow_unpinned_download);
        assert_eq!(config.functions.dir, PathBuf::from("./functions"));

        let runtime = config.to_runtime_config();
        assert!(!runtime.allow_unpinned_download);
        assert_eq!(runtime.startup_timeout, Duration::from_secs(30));
        assert_eq!(runtime.health_url(), "http://127.0.0.1:8081/health");
    }

    #[test]
    fn test_unpinned_download_opt_in() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            json!({
                "auth": { "jwt_secret": SECRET },
                "runtime": { "allow_unpinned_download": true }
            }),
        );

        let config = Config::load(&path).unwrap();
        assert!(config.runtime.allow_unpinned_download);
        assert!(config.to_runtime_config().allow_unpinned_download);
    }

    #[test]
    fn test_short_jwt_secret_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, json!({ "auth": { "jwt_secret": "short" } }));
        let err = Config::load(&path).unwrap_err();
        assert!(err.message().contains("jwt_secret"));
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("edgeplane.json");
        fs::write(&path, "{ not json").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert_eq!(err.code_str(), "EDGEPLANE_CLI_CONFIG_ERROR");
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let mut config = Config::default();
        config.auth.jwt_secret = SECRET.into();
        config
            .runtime
            .checksums
            .insert("linux-x64".into(), "abc".into());
        assert!(config.validate().is_err());

        config
            .runtime
            .checksums
            .insert("linux-x64".into(), "a".repeat(64));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.supabase.anon_key = "from-file".into();
        config.apply_env(|name| match name {
            ENV_JWT_SECRET => Some(SECRET.to_string()),
            ENV_ANON_KEY => Some(String::new()),
            ENV_SERVICE_ROLE_KEY => Some("svc".to_string()),
            _ => None,
        });
        assert_eq!(config.auth.jwt_secret, SECRET);
        assert_eq!(config.supabase.anon_key, "from-file");
        assert_eq!(config.supabase.service_role_key, "svc");
    }

    #[test]
    fn test_minted_keys_validate() {
        let mut config = Config::default();
        config.auth.jwt_secret = SECRET.into();
        config.supabase.service_role_key = "kept".into();
        config.mint_missing_keys().unwrap();

        let validator = JwtValidator::new(SECRET);
        let claims = validator.validate(&config.supabase.anon_key).unwrap();
        assert_eq!(claims.role, "anon");
        assert_eq!(config.supabase.service_role_key, "kept");
    }
}
