//! # Auth Module
//!
//! Bearer-token validation for function invocations and the cipher that
//! protects function secrets at rest. Both are keyed from the deployment's
//! JWT signing secret.

pub mod crypto;
pub mod errors;
pub mod jwt;

pub use crypto::SecretCipher;
pub use errors::{AuthError, AuthResult};
pub use jwt::{bearer_token, JwtClaims, JwtValidator};
