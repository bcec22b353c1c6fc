//! # Function Errors

use std::time::Duration;

use thiserror::Error;

/// Result type for function operations
pub type FunctionResult<T> = Result<T, FunctionError>;

/// Instructions returned when no pinned runtime build exists for the host.
pub const MANUAL_INSTALL_HINT: &str = "install the edge-runtime binary manually \
     (https://github.com/supabase/edge-runtime/releases), then either set \
     `runtime.binary_path` in the config or put `edge-runtime` on PATH";

/// Function control plane errors
#[derive(Debug, Clone, Error)]
pub enum FunctionError {
    // ==================
    // Acquisition Errors
    // ==================
    #[error("Download failed: {0}")]
    Download(String),

    #[error("Checksum mismatch for {platform}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        platform: String,
        expected: String,
        actual: String,
    },

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Unsupported platform {os}/{arch}: {hint}")]
    UnsupportedPlatform {
        os: String,
        arch: String,
        hint: &'static str,
    },

    #[error("Edge runtime binary not found: {0}")]
    BinaryNotFound(String),

    #[error(
        "No checksum pinned for edge-runtime {version} on {platform}; add one under \
         `runtime.checksums` or set `runtime.allow_unpinned_download`"
    )]
    UnpinnedDownload { version: String, platform: String },

    // ==================
    // Lifecycle Errors
    // ==================
    #[error("Edge runtime already started")]
    AlreadyStarted,

    #[error("Edge runtime did not become healthy within {0:?}")]
    ReadinessTimeout(Duration),

    #[error("Failed to spawn edge runtime: {0}")]
    Spawn(String),

    #[error("Edge runtime start cancelled")]
    Cancelled,

    // ==================
    // Persistence Errors
    // ==================
    #[error("Function not found: {0}")]
    NotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Config key not found: {0}")]
    ConfigNotFound(String),

    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Failed to decrypt secret: {0}")]
    Decryption(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(String),

    // ==================
    // Validation Errors
    // ==================
    #[error("Function already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FunctionError {
    /// Get HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            FunctionError::NotFound(_) => 404,
            FunctionError::FileNotFound(_) => 404,
            FunctionError::ConfigNotFound(_) => 404,
            FunctionError::SecretNotFound(_) => 404,
            FunctionError::AlreadyExists(_) => 409,
            FunctionError::AlreadyStarted => 409,
            FunctionError::InvalidName(_) => 400,
            FunctionError::InvalidPath(_) => 400,
            FunctionError::UnknownTemplate(_) => 400,
            FunctionError::ReadinessTimeout(_) => 504,
            FunctionError::Download(_) => 502,
            FunctionError::ChecksumMismatch { .. } => 502,
            FunctionError::Extraction(_) => 500,
            FunctionError::UnsupportedPlatform { .. } => 501,
            FunctionError::BinaryNotFound(_) => 500,
            FunctionError::UnpinnedDownload { .. } => 500,
            FunctionError::Spawn(_) => 500,
            FunctionError::Cancelled => 503,
            FunctionError::Decryption(_) => 500,
            FunctionError::Storage(_) => 500,
            FunctionError::Io(_) => 500,
            FunctionError::Internal(_) => 500,
        }
    }

    /// Whether the failure may succeed on a second attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FunctionError::Download(_) | FunctionError::ChecksumMismatch { .. }
        )
    }

    /// Whether the message can be shown to an API client as-is
    pub fn is_client_error(&self) -> bool {
        self.status_code() < 500
    }
}

impl From<std::io::Error> for FunctionError {
    fn from(e: std::io::Error) -> Self {
        FunctionError::Io(e.to_string())
    }
}

impl From<rusqlite::Error> for FunctionError {
    fn from(e: rusqlite::Error) -> Self {
        FunctionError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(FunctionError::NotFound("test".into()).status_code(), 404);
        assert_eq!(FunctionError::SecretNotFound("KEY".into()).status_code(), 404);
        assert_eq!(FunctionError::AlreadyExists("x".into()).status_code(), 409);
        assert_eq!(
            FunctionError::ReadinessTimeout(Duration::from_secs(30)).status_code(),
            504
        );
        assert_eq!(FunctionError::Decryption("bad tag".into()).status_code(), 500);
    }

    #[test]
    fn test_checksum_mismatch_is_retryable() {
        let err = FunctionError::ChecksumMismatch {
            platform: "linux-x64".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(err.is_retryable());
        assert!(!FunctionError::Extraction("broken".into()).is_retryable());
    }

    #[test]
    fn test_unsupported_platform_carries_fallback() {
        let err = FunctionError::UnsupportedPlatform {
            os: "windows".into(),
            arch: "x86_64".into(),
            hint: MANUAL_INSTALL_HINT,
        };
        let msg = err.to_string();
        assert!(msg.contains("windows"));
        assert!(msg.contains("binary_path"));
    }

    #[test]
    fn test_not_found_names_what_is_missing() {
        let file = FunctionError::FileNotFound("hello/lib/util.ts".into());
        let key = FunctionError::ConfigNotFound("site.name".into());
        assert_eq!(file.to_string(), "File not found: hello/lib/util.ts");
        assert_eq!(key.to_string(), "Config key not found: site.name");
        assert!(!file.to_string().contains("Function"));
        assert!(!key.to_string().contains("Function"));
        assert_eq!(file.status_code(), 404);
        assert_eq!(key.status_code(), 404);
    }

    #[test]
    fn test_unpinned_download_points_at_config() {
        let err = FunctionError::UnpinnedDownload {
            version: "1.67.4".into(),
            platform: "linux-x64".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("linux-x64"));
        assert!(msg.contains("allow_unpinned_download"));
        assert!(!err.is_retryable());
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_decryption_distinct_from_not_found() {
        let decrypt = FunctionError::Decryption("tag mismatch".into());
        let missing = FunctionError::SecretNotFound("API_KEY".into());
        assert_ne!(decrypt.status_code(), missing.status_code());
    }
}
