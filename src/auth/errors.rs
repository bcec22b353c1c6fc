//! # Auth Errors
//!
//! Error types for bearer-token validation and secret encryption.

use thiserror::Error;

/// Result type for auth operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Authentication errors
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    // ==================
    // JWT Errors
    // ==================
    /// No `Authorization: Bearer` header on the request
    #[error("Missing authorization header")]
    MissingToken,

    /// JWT token is malformed
    #[error("Malformed token")]
    MalformedToken,

    /// JWT token has expired
    #[error("Token expired")]
    TokenExpired,

    /// JWT signature is invalid
    #[error("Invalid token signature")]
    InvalidSignature,

    // ==================
    // Internal Errors
    // ==================
    /// Token generation failed
    #[error("Internal error: token generation failed")]
    TokenGenerationFailed,

    /// Ciphertext could not be decoded or authenticated
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Cipher could not encrypt
    #[error("Encryption failed")]
    EncryptionFailed,
}

impl AuthError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::MissingToken => 401,
            AuthError::MalformedToken => 401,
            AuthError::TokenExpired => 401,
            AuthError::InvalidSignature => 401,

            AuthError::TokenGenerationFailed => 500,
            AuthError::DecryptionFailed => 500,
            AuthError::EncryptionFailed => 500,
        }
    }
}
