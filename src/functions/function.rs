//! # Function Definitions
//!
//! A function is a directory under the functions root holding an
//! `index.ts` or `index.js` entrypoint. Nothing about it is registered
//! anywhere; every listing is a fresh filesystem scan.
//!
//! The name/path checks in this module guard every filesystem write the
//! admin API performs, so they are kept as small pure functions.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::errors::{FunctionError, FunctionResult};

/// Entrypoint file names, in order of preference
pub const ENTRYPOINTS: [&str; 2] = ["index.ts", "index.js"];

/// File extensions the file API may read or write
pub const ALLOWED_EXTENSIONS: [&str; 10] = [
    "ts", "js", "tsx", "jsx", "mjs", "json", "md", "txt", "html", "css",
];

/// Secret names the control plane injects itself
pub const RESERVED_SECRET_PREFIX: &str = "SUPABASE_";

const MAX_NAME_LEN: usize = 64;

/// Function status as seen by the admin API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionStatus {
    /// Runtime is healthy and will serve the function
    Active,
    /// Runtime is down or unhealthy
    Inactive,
}

/// A function discovered on disk
#[derive(Debug, Clone, Serialize)]
pub struct FunctionInfo {
    pub name: String,
    pub entrypoint: String,
    pub path: PathBuf,
    pub status: FunctionStatus,
    pub verify_jwt: bool,
    pub mod_time: Option<DateTime<Utc>>,
}

/// Persisted per-function configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionMetadata {
    pub name: String,

    /// Require a valid bearer JWT on invocation
    #[serde(default = "default_verify_jwt")]
    pub verify_jwt: bool,

    /// Memory limit hint for the runtime (MB)
    #[serde(default)]
    pub memory_mb: Option<u32>,

    /// Invocation timeout (ms); also bounds the proxy wait
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Import map path relative to the function directory
    #[serde(default)]
    pub import_map: Option<String>,

    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_verify_jwt() -> bool {
    true
}

impl FunctionMetadata {
    /// Defaults returned for a function with no stored row
    pub fn defaults(name: &str) -> Self {
        Self {
            name: name.to_string(),
            verify_jwt: true,
            memory_mb: None,
            timeout_ms: None,
            import_map: None,
            env_vars: BTreeMap::new(),
            created_at: None,
            updated_at: None,
        }
    }
}

/// Names starting with `.` or `_` are never functions
pub fn is_reserved_name(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_')
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("static regex is valid")
    })
}

fn secret_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex is valid"))
}

/// Validate a function name for use as a directory under the functions root
pub fn validate_function_name(name: &str) -> FunctionResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(FunctionError::InvalidName(format!(
            "function name must be 1-{} characters",
            MAX_NAME_LEN
        )));
    }
    if is_reserved_name(name) {
        return Err(FunctionError::InvalidName(format!(
            "'{}' is reserved (leading '.' or '_')",
            name
        )));
    }
    if !name_pattern().is_match(name) {
        return Err(FunctionError::InvalidName(format!(
            "'{}' may only contain letters, digits, '-' and '_'",
            name
        )));
    }
    Ok(())
}

/// Validate a secret name; it becomes an environment variable name
pub fn validate_secret_name(name: &str) -> FunctionResult<()> {
    if name.is_empty() || name.len() > 256 {
        return Err(FunctionError::InvalidName(
            "secret name must be 1-256 characters".to_string(),
        ));
    }
    if !secret_pattern().is_match(name) {
        return Err(FunctionError::InvalidName(format!(
            "'{}' is not a valid environment variable name",
            name
        )));
    }
    if name.to_ascii_uppercase().starts_with(RESERVED_SECRET_PREFIX) {
        return Err(FunctionError::InvalidName(format!(
            "'{}' uses the reserved {} prefix",
            name, RESERVED_SECRET_PREFIX
        )));
    }
    Ok(())
}

/// Validate a config key: 1-128 of letters, digits, `.`, `_`, `-`
pub fn validate_config_key(key: &str) -> FunctionResult<()> {
    let valid = !key.is_empty()
        && key.len() <= 128
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(FunctionError::InvalidName(format!("invalid config key '{}'", key)))
    }
}

/// Validate a path relative to a function directory.
///
/// Rejects empty, absolute, parent-referencing, backslash and NUL paths.
/// Returns the normalized relative path (`.` components dropped).
pub fn validate_relative_path(path: &str) -> FunctionResult<PathBuf> {
    if path.is_empty() {
        return Err(FunctionError::InvalidPath("empty path".to_string()));
    }
    if path.contains('\0') || path.contains('\\') {
        return Err(FunctionError::InvalidPath(format!(
            "illegal character in '{}'",
            path
        )));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(FunctionError::InvalidPath(format!(
            "'{}' escapes the function directory",
            path
        )));
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            _ => {
                return Err(FunctionError::InvalidPath(format!(
                    "'{}' must be relative to the function directory",
                    path
                )))
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(FunctionError::InvalidPath("empty path".to_string()));
    }
    Ok(normalized)
}

/// Whether the file extension is on the file API allowlist
pub fn is_allowed_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            ALLOWED_EXTENSIONS
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Find the entrypoint inside a function directory
pub fn find_entrypoint(dir: &Path) -> Option<&'static str> {
    ENTRYPOINTS
        .iter()
        .copied()
        .find(|entry| dir.join(entry).is_file())
}
