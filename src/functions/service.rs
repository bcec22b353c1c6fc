//! # Functions Service
//!
//! Wires the store and the runtime supervisor together and owns the
//! functions directory. Everything the admin API can do goes through here.
//!
//! Functions are discovered by scanning the directory on every call.
//! Secrets reach the runtime only through `start`/`restart`; `reload_secrets`
//! stages them for the next launch.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::errors::{FunctionError, FunctionResult};
use super::function::{
    find_entrypoint, is_allowed_extension, is_reserved_name, validate_config_key,
    validate_function_name, validate_relative_path, validate_secret_name, FunctionInfo,
    FunctionMetadata, FunctionStatus, ENTRYPOINTS,
};
use super::runtime::{RuntimeManager, RuntimeStatus};
use super::store::{SecretRecord, Store};
use super::templates::{self, Template, TEMPLATES};

/// Template used when `create_function` gets none
pub const DEFAULT_TEMPLATE: &str = "default";

/// A file inside a function directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionFile {
    /// Relative to the function directory, `/`-separated
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

fn modified(meta: &fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

/// Control plane facade
pub struct Service {
    functions_dir: PathBuf,
    store: Arc<Store>,
    runtime: Arc<RuntimeManager>,
    lifecycle: Mutex<()>,
}

impl Service {
    pub fn new(functions_dir: impl Into<PathBuf>, store: Arc<Store>, runtime: Arc<RuntimeManager>) -> Self {
        Self {
            functions_dir: functions_dir.into(),
            store,
            runtime,
            lifecycle: Mutex::new(()),
        }
    }

    pub fn functions_dir(&self) -> &Path {
        &self.functions_dir
    }

    pub fn runtime(&self) -> &Arc<RuntimeManager> {
        &self.runtime
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // ==================
    // Lifecycle
    // ==================

    /// Load secrets and start the runtime. No-op when already running.
    pub async fn start(&self, cancel: &CancellationToken) -> FunctionResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.runtime.state().is_running() {
            return Ok(());
        }
        fs::create_dir_all(&self.functions_dir)?;
        self.stage_secrets()?;
        self.runtime.start(cancel).await
    }

    /// Stop the runtime. No-op when not running.
    pub async fn stop(&self) -> FunctionResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.runtime.stop().await
    }

    /// Reload secrets, stop, start. A secret that fails to load leaves the
    /// running process untouched.
    pub async fn restart(&self, cancel: &CancellationToken) -> FunctionResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.stage_secrets()?;
        self.runtime.stop().await?;
        self.runtime.start(cancel).await
    }

    /// Re-read secrets for the next launch without restarting.
    /// Returns how many were staged.
    pub fn reload_secrets(&self) -> FunctionResult<usize> {
        self.stage_secrets()
    }

    fn stage_secrets(&self) -> FunctionResult<usize> {
        let secrets = self.store.get_all_secrets()?;
        let count = secrets.len();
        self.runtime.update_secrets(secrets)?;
        info!(op = "functions.secrets.staged", count = count);
        Ok(count)
    }

    pub fn is_healthy(&self) -> bool {
        self.runtime.is_healthy()
    }

    pub fn runtime_status(&self) -> FunctionResult<RuntimeStatus> {
        self.runtime.status()
    }

    // ==================
    // Discovery
    // ==================

    fn function_dir(&self, name: &str) -> PathBuf {
        self.functions_dir.join(name)
    }

    fn status(&self) -> FunctionStatus {
        if self.runtime.is_healthy() {
            FunctionStatus::Active
        } else {
            FunctionStatus::Inactive
        }
    }

    /// `None` when `dir` is not a function
    fn inspect(&self, name: &str, dir: &Path, status: FunctionStatus) -> Option<FunctionInfo> {
        if is_reserved_name(name) || !dir.is_dir() {
            return None;
        }
        let entrypoint = find_entrypoint(dir)?;
        let entry_path = dir.join(entrypoint);

        let verify_jwt = match self.store.get_metadata(name) {
            Ok(meta) => meta.verify_jwt,
            Err(e) => {
                warn!(op = "functions.metadata.read_failed", function = %name, error = %e);
                true
            }
        };

        Some(FunctionInfo {
            name: name.to_string(),
            entrypoint: entrypoint.to_string(),
            path: dir.to_path_buf(),
            status,
            verify_jwt,
            mod_time: fs::metadata(&entry_path).ok().as_ref().and_then(modified),
        })
    }

    /// All functions, sorted by name
    pub fn list_functions(&self) -> FunctionResult<Vec<FunctionInfo>> {
        let entries = match fs::read_dir(&self.functions_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let status = self.status();
        let mut functions: Vec<FunctionInfo> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?.to_string();
                self.inspect(&name, &entry.path(), status)
            })
            .collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(functions)
    }

    pub fn get_function(&self, name: &str) -> FunctionResult<FunctionInfo> {
        validate_function_name(name)?;
        self.inspect(name, &self.function_dir(name), self.status())
            .ok_or_else(|| FunctionError::NotFound(name.to_string()))
    }

    /// Whether `name` is a function right now. Invalid names are never
    /// functions.
    pub fn function_exists(&self, name: &str) -> bool {
        validate_function_name(name).is_ok() && find_entrypoint(&self.function_dir(name)).is_some()
    }

    fn require_function(&self, name: &str) -> FunctionResult<PathBuf> {
        validate_function_name(name)?;
        let dir = self.function_dir(name);
        if find_entrypoint(&dir).is_none() {
            return Err(FunctionError::NotFound(name.to_string()));
        }
        Ok(dir)
    }

    // ==================
    // Create / Delete
    // ==================

    pub fn templates(&self) -> &'static [Template] {
        &TEMPLATES
    }

    /// Scaffold a function from a template. Leaves nothing behind on failure.
    pub fn create_function(&self, name: &str, template: Option<&str>) -> FunctionResult<FunctionInfo> {
        validate_function_name(name)?;
        let source = templates::render(template.unwrap_or(DEFAULT_TEMPLATE), name)?;

        fs::create_dir_all(&self.functions_dir)?;
        let dir = self.function_dir(name);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(FunctionError::AlreadyExists(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let scaffolded = fs::write(dir.join(ENTRYPOINTS[0]), source)
            .map_err(FunctionError::from)
            .and_then(|()| self.store.set_metadata(&FunctionMetadata::defaults(name)));

        if let Err(e) = scaffolded {
            if let Err(cleanup) = fs::remove_dir_all(&dir) {
                warn!(op = "functions.create.rollback_failed", function = %name, error = %cleanup);
            }
            return Err(e);
        }

        info!(op = "functions.create", function = %name, template = template.unwrap_or(DEFAULT_TEMPLATE));
        self.get_function(name)
    }

    /// Remove the function directory and its metadata
    pub fn delete_function(&self, name: &str) -> FunctionResult<()> {
        validate_function_name(name)?;
        let dir = self.function_dir(name);
        if !dir.is_dir() {
            return Err(FunctionError::NotFound(name.to_string()));
        }
        fs::remove_dir_all(&dir)?;
        self.store.delete_metadata(name)?;
        info!(op = "functions.delete", function = %name);
        Ok(())
    }

    // ==================
    // Secrets
    // ==================

    pub fn set_secret(&self, name: &str, value: &str) -> FunctionResult<()> {
        validate_secret_name(name)?;
        self.store.set_secret(name, value)?;
        info!(op = "functions.secret.set", secret = %name);
        Ok(())
    }

    pub fn list_secrets(&self) -> FunctionResult<Vec<SecretRecord>> {
        self.store.list_secrets()
    }

    pub fn delete_secret(&self, name: &str) -> FunctionResult<()> {
        self.store.delete_secret(name)?;
        info!(op = "functions.secret.delete", secret = %name);
        Ok(())
    }

    // ==================
    // Metadata
    // ==================

    pub fn get_metadata(&self, name: &str) -> FunctionResult<FunctionMetadata> {
        self.require_function(name)?;
        self.store.get_metadata(name)
    }

    /// Full replace; the name always comes from the path
    pub fn set_metadata(&self, name: &str, mut meta: FunctionMetadata) -> FunctionResult<FunctionMetadata> {
        self.require_function(name)?;
        meta.name = name.to_string();
        self.store.set_metadata(&meta)?;
        self.store.get_metadata(name)
    }

    // ==================
    // Files
    // ==================

    /// Resolve a relative path inside a function, refusing anything that
    /// lands outside it (including through symlinks).
    fn resolve_file(&self, name: &str, path: &str) -> FunctionResult<(PathBuf, PathBuf)> {
        let dir = self.require_function(name)?;
        let relative = validate_relative_path(path)?;
        let target = dir.join(&relative);

        // symlink_metadata so a dangling link stops the walk instead of
        // being skipped as missing
        let root = dir.canonicalize()?;
        let mut existing = target.as_path();
        while fs::symlink_metadata(existing).is_err() {
            existing = existing
                .parent()
                .ok_or_else(|| FunctionError::InvalidPath(path.to_string()))?;
        }
        let resolved = existing.canonicalize().map_err(|_| {
            FunctionError::InvalidPath(format!("'{}' goes through a dangling link", path))
        })?;
        if !resolved.starts_with(&root) {
            return Err(FunctionError::InvalidPath(format!(
                "'{}' escapes the function directory",
                path
            )));
        }
        Ok((target, relative))
    }

    /// Every regular file in the function, sorted by path
    pub fn list_files(&self, name: &str) -> FunctionResult<Vec<FunctionFile>> {
        let dir = self.require_function(name)?;
        let mut files = Vec::new();
        collect_files(&dir, &dir, &mut files)?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    pub fn read_file(&self, name: &str, path: &str) -> FunctionResult<String> {
        let (target, _) = self.resolve_file(name, path)?;
        if !target.is_file() {
            return Err(FunctionError::FileNotFound(format!("{}/{}", name, path)));
        }
        let bytes = fs::read(&target)?;
        String::from_utf8(bytes)
            .map_err(|_| FunctionError::InvalidPath(format!("'{}' is not UTF-8 text", path)))
    }

    /// Create or replace a file, creating parent directories
    pub fn write_file(&self, name: &str, path: &str, content: &str) -> FunctionResult<FunctionFile> {
        let (target, relative) = self.resolve_file(name, path)?;
        if !is_allowed_extension(&relative) {
            return Err(FunctionError::InvalidPath(format!(
                "'{}' does not have an allowed extension",
                path
            )));
        }
        if target.is_dir() {
            return Err(FunctionError::InvalidPath(format!("'{}' is a directory", path)));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, content)?;

        let meta = fs::metadata(&target)?;
        Ok(FunctionFile {
            path: to_slash(&relative),
            size: meta.len(),
            modified: modified(&meta),
        })
    }

    /// Delete a file. The last remaining entrypoint cannot be deleted.
    pub fn delete_file(&self, name: &str, path: &str) -> FunctionResult<()> {
        let (target, relative) = self.resolve_file(name, path)?;
        if !target.is_file() {
            return Err(FunctionError::FileNotFound(format!("{}/{}", name, path)));
        }

        let dir = self.function_dir(name);
        let is_entrypoint = ENTRYPOINTS.iter().any(|e| relative == Path::new(e));
        let remaining = ENTRYPOINTS
            .iter()
            .filter(|e| relative != Path::new(*e) && dir.join(*e).is_file())
            .count();
        if is_entrypoint && remaining == 0 {
            return Err(FunctionError::InvalidPath(format!(
                "'{}' is the function entrypoint; delete the function instead",
                path
            )));
        }

        fs::remove_file(&target)?;
        Ok(())
    }

    // ==================
    // Config
    // ==================

    pub fn get_config(&self, key: &str) -> FunctionResult<Option<String>> {
        validate_config_key(key)?;
        self.store.get_config(key)
    }

    pub fn set_config(&self, key: &str, value: &str) -> FunctionResult<()> {
        validate_config_key(key)?;
        self.store.set_config(key, value)
    }

    pub fn get_all_config(&self) -> FunctionResult<std::collections::BTreeMap<String, String>> {
        self.store.get_all_config()
    }

    pub fn delete_config(&self, key: &str) -> FunctionResult<bool> {
        validate_config_key(key)?;
        self.store.delete_config(key)
    }
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<FunctionFile>) -> FunctionResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let meta = entry.metadata()?;
            let relative = path.strip_prefix(root).unwrap_or(&path);
            out.push(FunctionFile {
                path: to_slash(relative),
                size: meta.len(),
                modified: modified(&meta),
            });
        }
    }
    Ok(())
}
