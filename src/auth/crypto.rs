//! # Secret Encryption
//!
//! AES-256-GCM for function secrets at rest.
//!
//! ## Invariants
//! - The key is SHA-256(JWT signing secret) and is never persisted
//! - Every encryption uses a fresh random 96-bit nonce
//! - Stored form is `base64(nonce || ciphertext || tag)`

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use super::errors::{AuthError, AuthResult};

/// AES-GCM nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// Derive the 256-bit encryption key from the JWT secret
pub fn derive_key(jwt_secret: &str) -> [u8; 32] {
    let digest = Sha256::digest(jwt_secret.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

/// Hex SHA-256 of arbitrary bytes
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Encrypts and decrypts secret values
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    /// Build a cipher keyed from the deployment's JWT secret
    pub fn from_jwt_secret(jwt_secret: &str) -> Self {
        let key = derive_key(jwt_secret);
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    /// Encrypt bytes into the stored text form
    pub fn encrypt(&self, plaintext: &[u8]) -> AuthResult<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| AuthError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    /// Decrypt the stored text form back into bytes
    pub fn decrypt(&self, encoded: &str) -> AuthResult<Vec<u8>> {
        let sealed = STANDARD
            .decode(encoded)
            .map_err(|_| AuthError::DecryptionFailed)?;

        if sealed.len() < NONCE_SIZE {
            return Err(AuthError::DecryptionFailed);
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AuthError::DecryptionFailed)
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretCipher { .. }")
    }
}
