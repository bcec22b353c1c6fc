//! # JWT Validation
//!
//! HS256 bearer tokens signed with the deployment's JWT secret. The same
//! secret signs the anon and service-role API keys handed to the edge
//! runtime.
//!
//! Validation is stateless: signature + expiry only, no audience check,
//! because tokens come from the product's auth service with varying `aud`.

use axum::http::{header, HeaderMap};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::errors::{AuthError, AuthResult};

/// Claims carried by invocation tokens and API keys
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user ID); absent on API keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Postgres role: `anon`, `authenticated`, `service_role`
    #[serde(default)]
    pub role: String,

    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Issued at timestamp (Unix epoch seconds)
    #[serde(default)]
    pub iat: i64,

    /// Expiration timestamp (Unix epoch seconds)
    pub exp: i64,
}

/// Validates and mints HS256 tokens
#[derive(Clone)]
pub struct JwtValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
}

impl JwtValidator {
    /// Create a validator for the given signing secret
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: "edgeplane".to_string(),
        }
    }

    /// Validate a token and extract its claims
    pub fn validate(&self, token: &str) -> AuthResult<JwtClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;

        let token_data =
            decode::<JwtClaims>(token, &self.decoding_key, &validation).map_err(|e| {
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                    jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                        AuthError::InvalidSignature
                    }
                    _ => AuthError::MalformedToken,
                }
            })?;

        Ok(token_data.claims)
    }

    /// Validate the bearer token on a request
    pub fn validate_headers(&self, headers: &HeaderMap) -> AuthResult<JwtClaims> {
        let token = bearer_token(headers).ok_or(AuthError::MissingToken)?;
        self.validate(token)
    }

    /// Mint a token for `role` valid for `ttl`
    pub fn issue(&self, role: &str, ttl: Duration) -> AuthResult<String> {
        let now = Utc::now();
        let claims = JwtClaims {
            sub: None,
            role: role.to_string(),
            iss: Some(self.issuer.clone()),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|_| AuthError::TokenGenerationFailed)
    }
}

/// Extract the token from `Authorization: Bearer <token>`.
///
/// The scheme is matched case-insensitively; an empty token is treated as
/// absent.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
