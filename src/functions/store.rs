//! # Function Store
//!
//! Durable config, secrets and per-function metadata in SQLite.
//!
//! ## Invariants
//! - Secret values reach the database only as `SecretCipher` output
//! - Read APIs never return secret values, except `get_secret` and
//!   `get_all_secrets`, which exist for launch-time env injection
//! - Metadata writes are full upserts; `created_at` survives updates

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::errors::{FunctionError, FunctionResult};
use super::function::FunctionMetadata;
use crate::auth::SecretCipher;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS config (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS secrets (
    name       TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS metadata (
    name       TEXT PRIMARY KEY,
    verify_jwt INTEGER NOT NULL DEFAULT 1,
    memory_mb  INTEGER,
    timeout_ms INTEGER,
    import_map TEXT,
    env_vars   TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// Secret as exposed by list APIs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretRecord {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed store
pub struct Store {
    conn: Mutex<Connection>,
    cipher: SecretCipher,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

fn parse_time(raw: &str) -> FunctionResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| FunctionError::Storage(format!("invalid timestamp '{}': {}", raw, e)))
}

impl Store {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: impl AsRef<Path>, jwt_secret: &str) -> FunctionResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::with_connection(Connection::open(path)?, jwt_secret)
    }

    /// Open a private in-memory database
    pub fn open_in_memory(jwt_secret: &str) -> FunctionResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, jwt_secret)
    }

    fn with_connection(conn: Connection, jwt_secret: &str) -> FunctionResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            cipher: SecretCipher::from_jwt_secret(jwt_secret),
        })
    }

    fn conn(&self) -> FunctionResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| FunctionError::Internal("store lock poisoned".into()))
    }

    // ==================
    // Config
    // ==================

    pub fn set_config(&self, key: &str, value: &str) -> FunctionResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn()?.execute(
            "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    /// `None` when the key was never set
    pub fn get_config(&self, key: &str) -> FunctionResult<Option<String>> {
        let value = self
            .conn()?
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn get_all_config(&self) -> FunctionResult<BTreeMap<String, String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut config = BTreeMap::new();
        for row in rows {
            let (key, value): (String, String) = row?;
            config.insert(key, value);
        }
        Ok(config)
    }

    /// Returns whether the key existed
    pub fn delete_config(&self, key: &str) -> FunctionResult<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM config WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    // ==================
    // Secrets
    // ==================

    /// Encrypt and upsert a secret
    pub fn set_secret(&self, name: &str, value: &str) -> FunctionResult<()> {
        let sealed = self
            .cipher
            .encrypt(value.as_bytes())
            .map_err(|e| FunctionError::Internal(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        self.conn()?.execute(
            "INSERT INTO secrets (name, value, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![name, sealed, now],
        )?;
        Ok(())
    }

    /// Decrypt a single secret
    pub fn get_secret(&self, name: &str) -> FunctionResult<String> {
        let sealed: Option<String> = self
            .conn()?
            .query_row(
                "SELECT value FROM secrets WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        let sealed = sealed.ok_or_else(|| FunctionError::SecretNotFound(name.to_string()))?;
        self.open_secret(name, &sealed)
    }

    fn open_secret(&self, name: &str, sealed: &str) -> FunctionResult<String> {
        let plain = self
            .cipher
            .decrypt(sealed)
            .map_err(|_| FunctionError::Decryption(name.to_string()))?;
        String::from_utf8(plain).map_err(|_| FunctionError::Decryption(name.to_string()))
    }

    pub fn delete_secret(&self, name: &str) -> FunctionResult<()> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM secrets WHERE name = ?1", params![name])?;
        if deleted == 0 {
            return Err(FunctionError::SecretNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Names and timestamps, sorted by name
    pub fn list_secrets(&self) -> FunctionResult<Vec<SecretRecord>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT name, created_at, updated_at FROM secrets ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut secrets = Vec::new();
        for row in rows {
            let (name, created_at, updated_at) = row?;
            secrets.push(SecretRecord {
                name,
                created_at: parse_time(&created_at)?,
                updated_at: parse_time(&updated_at)?,
            });
        }
        Ok(secrets)
    }

    /// Every secret decrypted; only for building the runtime's environment
    pub fn get_all_secrets(&self) -> FunctionResult<HashMap<String, String>> {
        let sealed: Vec<(String, String)> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare("SELECT name, value FROM secrets")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let collected = rows.collect::<Result<Vec<_>, _>>()?;
            collected
        };

        sealed
            .into_iter()
            .map(|(name, value)| {
                let plain = self.open_secret(&name, &value)?;
                Ok((name, plain))
            })
            .collect()
    }

    // ==================
    // Metadata
    // ==================

    /// Stored metadata, or defaults when the function has no row
    pub fn get_metadata(&self, name: &str) -> FunctionResult<FunctionMetadata> {
        let row = self
            .conn()?
            .query_row(
                "SELECT verify_jwt, memory_mb, timeout_ms, import_map, env_vars, created_at, updated_at
                 FROM metadata WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, bool>(0)?,
                        row.get::<_, Option<u32>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((verify_jwt, memory_mb, timeout_ms, import_map, env_vars, created, updated)) = row
        else {
            return Ok(FunctionMetadata::defaults(name));
        };

        let env_vars: BTreeMap<String, String> = serde_json::from_str(&env_vars)
            .map_err(|e| FunctionError::Storage(format!("invalid env_vars for {}: {}", name, e)))?;

        Ok(FunctionMetadata {
            name: name.to_string(),
            verify_jwt,
            memory_mb,
            timeout_ms: timeout_ms.map(|ms| ms.max(0) as u64),
            import_map,
            env_vars,
            created_at: Some(parse_time(&created)?),
            updated_at: Some(parse_time(&updated)?),
        })
    }

    /// Full upsert of a function's metadata
    pub fn set_metadata(&self, meta: &FunctionMetadata) -> FunctionResult<()> {
        let env_vars = serde_json::to_string(&meta.env_vars)
            .map_err(|e| FunctionError::Internal(format!("serialize env_vars: {}", e)))?;
        let now = Utc::now().to_rfc3339();
        let timeout_ms = meta.timeout_ms.map(|ms| ms.min(i64::MAX as u64) as i64);

        self.conn()?.execute(
            "INSERT INTO metadata
                 (name, verify_jwt, memory_mb, timeout_ms, import_map, env_vars, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(name) DO UPDATE SET
                 verify_jwt = excluded.verify_jwt,
                 memory_mb  = excluded.memory_mb,
                 timeout_ms = excluded.timeout_ms,
                 import_map = excluded.import_map,
                 env_vars   = excluded.env_vars,
                 updated_at = excluded.updated_at",
            params![
                meta.name,
                meta.verify_jwt,
                meta.memory_mb,
                timeout_ms,
                meta.import_map,
                env_vars,
                now
            ],
        )?;
        Ok(())
    }

    /// Remove a function's metadata row; absent rows are not an error
    pub fn delete_metadata(&self, name: &str) -> FunctionResult<()> {
        self.conn()?
            .execute("DELETE FROM metadata WHERE name = ?1", params![name])?;
        Ok(())
    }
}
