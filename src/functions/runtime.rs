//! # Edge Runtime Supervisor
//!
//! Owns at most one edge-runtime subprocess: resolves the binary, launches
//! it with the deployment's keys and secrets in its environment, waits for
//! `/health`, then probes it in the background.
//!
//! ## State machine
//! ```text
//! NotStarted/Stopped --start--> Starting --ready--> Healthy <--probe--> Unhealthy
//!        any --stop--> Stopped
//! ```
//! A failed or cancelled start returns to the state it began in.
//!
//! ## Locking
//! All mutable state sits behind one `std::sync::Mutex` that is never held
//! across an `.await`. Every start/stop bumps a generation counter; the
//! health loop and in-flight starts drop their results when it moves.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::downloader::{self, Downloader, BINARY_NAME};
use super::errors::{FunctionError, FunctionResult, MANUAL_INSTALL_HINT};
use super::process::{LaunchSpec, ProcessController, ProcessHandle};
use crate::observability::LogSink;

pub const DEFAULT_PORT: u16 = 8081;
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-probe HTTP timeout
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Locations checked before PATH
pub const WELL_KNOWN_PATHS: [&str; 2] = ["./bin/edge-runtime", "/usr/local/bin/edge-runtime"];

/// Launch and supervision parameters
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Directory passed as `--main-service`
    pub functions_dir: PathBuf,
    pub host: String,
    pub port: u16,

    pub version: String,
    pub download_dir: PathBuf,
    pub download_base_url: String,
    /// Extra checksum pins keyed `"<os>-<arch>"`
    pub checksums: HashMap<String, String>,
    /// Skips resolution entirely when set
    pub binary_path: Option<PathBuf>,
    pub search_paths: Vec<PathBuf>,
    pub auto_download: bool,
    /// Install a release with no checksum pin for this platform
    pub allow_unpinned_download: bool,

    pub supabase_url: String,
    pub anon_key: String,
    pub service_role_key: String,
    pub db_url: String,

    /// Injected as env on the next launch
    pub secrets: HashMap<String, String>,

    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub health_interval: Duration,
    pub stop_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            functions_dir: PathBuf::from("./functions"),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            version: downloader::DEFAULT_VERSION.to_string(),
            download_dir: PathBuf::from("./data/bin"),
            download_base_url: downloader::DEFAULT_BASE_URL.to_string(),
            checksums: HashMap::new(),
            binary_path: None,
            search_paths: WELL_KNOWN_PATHS.iter().map(PathBuf::from).collect(),
            auto_download: true,
            allow_unpinned_download: false,
            supabase_url: "http://127.0.0.1:54321".to_string(),
            anon_key: String::new(),
            service_role_key: String::new(),
            db_url: String::new(),
            secrets: HashMap::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl RuntimeConfig {
    /// `http://<host>:<port>`
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url())
    }
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut secret_names: Vec<_> = self.secrets.keys().collect();
        secret_names.sort();
        f.debug_struct("RuntimeConfig")
            .field("functions_dir", &self.functions_dir)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("version", &self.version)
            .field("download_dir", &self.download_dir)
            .field("binary_path", &self.binary_path)
            .field("auto_download", &self.auto_download)
            .field("allow_unpinned_download", &self.allow_unpinned_download)
            .field("supabase_url", &self.supabase_url)
            .field("secrets", &secret_names)
            .finish_non_exhaustive()
    }
}

/// Supervisor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    NotStarted,
    Starting,
    Healthy,
    Unhealthy,
    Stopped,
}

impl RuntimeState {
    /// Whether a process is (or is being) launched
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            RuntimeState::Starting | RuntimeState::Healthy | RuntimeState::Unhealthy
        )
    }
}

/// Point-in-time view for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub state: RuntimeState,
    pub healthy: bool,
    pub pid: Option<u32>,
    pub port: u16,
    pub binary_path: Option<PathBuf>,
    pub version: String,
    pub started_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: RuntimeState,
    healthy: bool,
    generation: u64,
    process: Option<Box<dyn ProcessHandle>>,
    pid: Option<u32>,
    binary: Option<PathBuf>,
    started_at: Option<DateTime<Utc>>,
    health_cancel: Option<CancellationToken>,
    secrets: HashMap<String, String>,
}

type SharedInner = Arc<Mutex<Inner>>;

fn lock(inner: &Mutex<Inner>) -> FunctionResult<MutexGuard<'_, Inner>> {
    inner
        .lock()
        .map_err(|_| FunctionError::Internal("runtime state lock poisoned".into()))
}

/// Restores the pre-start state if a start does not complete, including
/// when the start future is dropped mid-flight.
struct StartGuard {
    inner: SharedInner,
    previous: RuntimeState,
    generation: u64,
    armed: bool,
}

impl StartGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut inner) = self.inner.lock() {
            if inner.generation == self.generation {
                inner.state = self.previous;
                inner.healthy = false;
                inner.pid = None;
                // Dropping the handle kills a real child (kill_on_drop)
                inner.process = None;
            }
        }
    }
}

/// Supervises one edge-runtime subprocess
pub struct RuntimeManager {
    config: RuntimeConfig,
    inner: SharedInner,
    controller: Arc<dyn ProcessController>,
    sink: Arc<dyn LogSink>,
    downloader: tokio::sync::Mutex<Downloader>,
    client: reqwest::Client,
}

impl RuntimeManager {
    pub fn new(
        config: RuntimeConfig,
        controller: Arc<dyn ProcessController>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let downloader = Downloader::new(config.version.clone(), config.download_dir.clone())
            .with_base_url(config.download_base_url.clone())
            .with_checksums(config.checksums.clone())
            .with_allow_unpinned(config.allow_unpinned_download);

        let inner = Inner {
            state: RuntimeState::NotStarted,
            healthy: false,
            generation: 0,
            process: None,
            pid: None,
            binary: None,
            started_at: None,
            health_cancel: None,
            secrets: config.secrets.clone(),
        };

        Self {
            config,
            inner: Arc::new(Mutex::new(inner)),
            controller,
            sink,
            downloader: tokio::sync::Mutex::new(downloader),
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Launch the runtime and wait until it answers `/health`.
    ///
    /// Fails with `AlreadyStarted` unless the runtime is not started or
    /// stopped. On readiness timeout or cancellation the process is torn
    /// down and the previous state restored.
    pub async fn start(&self, cancel: &CancellationToken) -> FunctionResult<()> {
        let (previous, generation, secrets) = {
            let mut inner = lock(&self.inner)?;
            if inner.state.is_running() {
                return Err(FunctionError::AlreadyStarted);
            }
            let previous = inner.state;
            inner.state = RuntimeState::Starting;
            inner.healthy = false;
            inner.generation += 1;
            (previous, inner.generation, inner.secrets.clone())
        };
        let mut guard = StartGuard {
            inner: self.inner.clone(),
            previous,
            generation,
            armed: true,
        };

        let binary = self.resolve_binary().await?;
        let spec = self.launch_spec(&binary, &secrets)?;

        info!(
            op = "runtime.start",
            binary = %binary.display(),
            port = self.config.port,
            env = %spec.env_keys().join(","),
            "Launching edge runtime"
        );

        let handle = self.controller.start(&spec, self.sink.clone()).await?;
        let pid = handle.pid();
        {
            let mut inner = lock(&self.inner)?;
            if inner.generation != generation {
                return Err(FunctionError::Cancelled);
            }
            inner.process = Some(handle);
            inner.pid = pid;
        }

        if let Err(e) = self.wait_ready(generation, cancel).await {
            guard.disarm();
            self.abort_start(generation, previous).await;
            self.sink.error("runtime.start.failed", &[("error", &e.to_string())]);
            return Err(e);
        }

        let health_cancel = CancellationToken::new();
        {
            let mut inner = lock(&self.inner)?;
            if inner.generation != generation {
                return Err(FunctionError::Cancelled);
            }
            inner.state = RuntimeState::Healthy;
            inner.healthy = true;
            inner.binary = Some(binary);
            inner.started_at = Some(Utc::now());
            inner.health_cancel = Some(health_cancel.clone());
        }
        guard.disarm();

        tokio::spawn(health_loop(
            self.inner.clone(),
            self.client.clone(),
            self.config.health_url(),
            self.sink.clone(),
            self.config.health_interval,
            generation,
            health_cancel,
        ));

        let pid = pid.map(|p| p.to_string()).unwrap_or_default();
        let port = self.config.port.to_string();
        self.sink.info("runtime.ready", &[("pid", &pid), ("port", &port)]);
        Ok(())
    }

    /// Stop the runtime: SIGTERM, then SIGKILL after the stop timeout.
    /// No-op when nothing was started.
    pub async fn stop(&self) -> FunctionResult<()> {
        let handle = {
            let mut inner = lock(&self.inner)?;
            if !inner.state.is_running() && inner.process.is_none() {
                return Ok(());
            }
            if let Some(token) = inner.health_cancel.take() {
                token.cancel();
            }
            inner.generation += 1;
            inner.state = RuntimeState::Stopped;
            inner.healthy = false;
            inner.pid = None;
            inner.started_at = None;
            inner.process.take()
        };

        if let Some(handle) = handle {
            self.shutdown(handle).await;
        }
        Ok(())
    }

    pub async fn restart(&self, cancel: &CancellationToken) -> FunctionResult<()> {
        self.stop().await?;
        self.start(cancel).await
    }

    /// Replace the secrets injected on the next launch. A running process
    /// keeps the environment it was started with.
    pub fn update_secrets(&self, secrets: HashMap<String, String>) -> FunctionResult<()> {
        lock(&self.inner)?.secrets = secrets;
        Ok(())
    }

    /// Last observed health; never probes
    pub fn is_healthy(&self) -> bool {
        lock(&self.inner).map(|i| i.healthy).unwrap_or(false)
    }

    pub fn state(&self) -> RuntimeState {
        lock(&self.inner)
            .map(|i| i.state)
            .unwrap_or(RuntimeState::Stopped)
    }

    pub fn status(&self) -> FunctionResult<RuntimeStatus> {
        let inner = lock(&self.inner)?;
        Ok(RuntimeStatus {
            state: inner.state,
            healthy: inner.healthy,
            pid: inner.pid,
            port: self.config.port,
            binary_path: inner.binary.clone(),
            version: self.config.version.clone(),
            started_at: inner.started_at,
        })
    }

    /// Ensure a binary is available without launching it
    pub async fn install(&self) -> FunctionResult<PathBuf> {
        self.resolve_binary().await
    }

    /// Binary resolution order: explicit path, installed download,
    /// well-known paths, PATH, then auto-download.
    async fn resolve_binary(&self) -> FunctionResult<PathBuf> {
        if let Some(explicit) = &self.config.binary_path {
            if explicit.is_file() {
                return Ok(explicit.clone());
            }
            return Err(FunctionError::BinaryNotFound(format!(
                "configured binary {} does not exist",
                explicit.display()
            )));
        }

        let downloader = self.downloader.lock().await;
        if downloader.is_installed() {
            return Ok(downloader.binary_path());
        }
        if let Some(found) = self.config.search_paths.iter().find(|p| is_executable(p)) {
            debug!(op = "runtime.binary.found", path = %found.display());
            return Ok(found.clone());
        }
        if let Some(found) = std::env::var_os("PATH").and_then(|p| find_in_path(BINARY_NAME, &p)) {
            debug!(op = "runtime.binary.found", path = %found.display(), source = "PATH");
            return Ok(found);
        }
        if !self.config.auto_download {
            return Err(FunctionError::BinaryNotFound(MANUAL_INSTALL_HINT.to_string()));
        }

        let platform = downloader.platform()?;
        self.sink.info(
            "runtime.download",
            &[("version", downloader.version()), ("platform", &platform.key())],
        );

        let last_decile = AtomicU64::new(0);
        let progress = |done: u64, total: u64| {
            let decile = done.saturating_mul(10) / total.max(1);
            if decile > last_decile.swap(decile, Ordering::Relaxed) {
                info!(op = "runtime.download.progress", downloaded = done, total = total);
            }
        };
        downloader.ensure_binary(Some(&progress)).await
    }

    fn launch_spec(&self, binary: &Path, secrets: &HashMap<String, String>) -> FunctionResult<LaunchSpec> {
        let functions_dir = absolute(&self.config.functions_dir)?;

        let mut env = vec![
            ("SUPABASE_URL".to_string(), self.config.supabase_url.clone()),
            ("SUPABASE_ANON_KEY".to_string(), self.config.anon_key.clone()),
            ("SUPABASE_SERVICE_ROLE_KEY".to_string(), self.config.service_role_key.clone()),
            ("SUPABASE_DB_URL".to_string(), self.config.db_url.clone()),
        ];
        let mut names: Vec<_> = secrets.keys().collect();
        names.sort();
        for name in names {
            env.push((name.clone(), secrets[name].clone()));
        }

        Ok(LaunchSpec {
            program: binary.to_path_buf(),
            args: vec![
                "start".to_string(),
                "--main-service".to_string(),
                functions_dir.to_string_lossy().into_owned(),
                "--port".to_string(),
                self.config.port.to_string(),
            ],
            env,
            cwd: None,
        })
    }

    /// Poll `/health` until 200, the deadline, cancellation, or process exit
    async fn wait_ready(&self, generation: u64, cancel: &CancellationToken) -> FunctionResult<()> {
        let url = self.config.health_url();
        let deadline = Instant::now() + self.config.startup_timeout;

        loop {
            self.check_launch(generation)?;

            let healthy = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FunctionError::Cancelled),
                ok = probe(&self.client, &url) => ok,
            };
            if healthy {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FunctionError::ReadinessTimeout(self.config.startup_timeout));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FunctionError::Cancelled),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    fn check_launch(&self, generation: u64) -> FunctionResult<()> {
        let mut inner = lock(&self.inner)?;
        if inner.generation != generation {
            return Err(FunctionError::Cancelled);
        }
        match inner.process.as_mut().map(|process| process.has_exited()) {
            Some(true) => Err(FunctionError::Spawn(
                "edge runtime exited before becoming healthy".to_string(),
            )),
            Some(false) => Ok(()),
            None => Err(FunctionError::Cancelled),
        }
    }

    async fn abort_start(&self, generation: u64, previous: RuntimeState) {
        let handle = match self.inner.lock() {
            Ok(mut inner) if inner.generation == generation => {
                inner.state = previous;
                inner.healthy = false;
                inner.pid = None;
                inner.process.take()
            }
            _ => None,
        };
        if let Some(mut handle) = handle {
            if let Err(e) = handle.kill().await {
                warn!(op = "runtime.start.teardown_failed", error = %e);
            }
        }
    }

    async fn shutdown(&self, mut handle: Box<dyn ProcessHandle>) {
        let pid = handle.pid().map(|p| p.to_string()).unwrap_or_default();

        if let Err(e) = handle.terminate().await {
            warn!(op = "runtime.stop.signal_failed", pid = %pid, error = %e);
        }

        match tokio::time::timeout(self.config.stop_timeout, handle.wait()).await {
            Ok(Ok(code)) => {
                let code = code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into());
                self.sink.info("runtime.stopped", &[("pid", &pid), ("exit", &code)]);
            }
            Ok(Err(e)) => {
                warn!(op = "runtime.stop.wait_failed", pid = %pid, error = %e);
            }
            Err(_) => {
                let waited = format!("{:?}", self.config.stop_timeout);
                self.sink.warn("runtime.stop.forced", &[("pid", &pid), ("waited", &waited)]);
                if let Err(e) = handle.kill().await {
                    warn!(op = "runtime.stop.kill_failed", pid = %pid, error = %e);
                }
            }
        }
    }
}

impl Drop for RuntimeManager {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(token) = inner.health_cancel.take() {
                token.cancel();
            }
        }
    }
}

async fn probe(client: &reqwest::Client, url: &str) -> bool {
    matches!(
        client.get(url).timeout(PROBE_TIMEOUT).send().await,
        Ok(response) if response.status().is_success()
    )
}

/// Periodic probe; logs only when health flips
async fn health_loop(
    inner: SharedInner,
    client: reqwest::Client,
    url: String,
    sink: Arc<dyn LogSink>,
    interval: Duration,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let healthy = probe(&client, &url).await;

        let flipped = {
            let Ok(mut inner) = inner.lock() else {
                return;
            };
            if inner.generation != generation {
                return;
            }
            if inner.healthy == healthy {
                false
            } else {
                inner.healthy = healthy;
                inner.state = if healthy {
                    RuntimeState::Healthy
                } else {
                    RuntimeState::Unhealthy
                };
                true
            }
        };

        if flipped && healthy {
            sink.info("runtime.health.recovered", &[("url", &url)]);
        } else if flipped {
            sink.warn("runtime.health.degraded", &[("url", &url)]);
        }
    }
}

fn absolute(path: &Path) -> FunctionResult<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// First executable named `name` in a PATH-style list
pub fn find_in_path(name: &str, path_var: &std::ffi::OsStr) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::process::{FakeBehavior, RecordingController};
    use crate::observability::{MemorySink, Severity};
    use std::sync::atomic::AtomicBool;

    use axum::{http::StatusCode, routing::get, Router};
    use tempfile::TempDir;

    /// Serves `/health` with 200 while `up` is set, 503 otherwise
    async fn stub_runtime(up: Arc<AtomicBool>) -> u16 {
        let app = Router::new().route(
            "/health",
            get(move || {
                let up = up.clone();
                async move {
                    if up.load(Ordering::SeqCst) {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    struct Fixture {
        _temp: TempDir,
        manager: RuntimeManager,
        controller: Arc<RecordingController>,
        sink: Arc<MemorySink>,
    }

    fn fixture(port: u16, behavior: FakeBehavior, tune: impl FnOnce(&mut RuntimeConfig)) -> Fixture {
        let temp = TempDir::new().unwrap();
        let binary = temp.path().join("edge-runtime");
        std::fs::write(&binary, b"#!/bin/sh\n").unwrap();
        std::fs::create_dir_all(temp.path().join("functions")).unwrap();

        let mut config = RuntimeConfig {
            functions_dir: temp.path().join("functions"),
            port,
            download_dir: temp.path().join("bin"),
            binary_path: Some(binary),
            auto_download: false,
            anon_key: "anon".into(),
            service_role_key: "service".into(),
            db_url: "postgres://localhost/db".into(),
            startup_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            health_interval: Duration::from_millis(50),
            stop_timeout: Duration::from_millis(200),
            ..RuntimeConfig::default()
        };
        tune(&mut config);

        let controller = Arc::new(RecordingController::with_behavior(behavior));
        let sink = Arc::new(MemorySink::new());
        let manager = RuntimeManager::new(config, controller.clone(), sink.clone());
        Fixture {
            _temp: temp,
            manager,
            controller,
            sink,
        }
    }

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_start_healthy_then_stop() {
        let port = stub_runtime(Arc::new(AtomicBool::new(true))).await;
        let f = fixture(port, FakeBehavior::Normal, |_| {});

        f.manager.start(&CancellationToken::new()).await.unwrap();
        assert!(f.manager.is_healthy());

        let status = f.manager.status().unwrap();
        assert_eq!(status.state, RuntimeState::Healthy);
        assert!(status.pid.is_some());
        assert!(status.started_at.is_some());
        assert_eq!(status.port, port);

        let launch = f.controller.last_launch().unwrap();
        assert_eq!(launch.args[0], "start");
        assert_eq!(launch.args[1], "--main-service");
        assert!(Path::new(&launch.args[2]).is_absolute());
        assert_eq!(launch.args[3..], ["--port".to_string(), port.to_string()]);
        assert_eq!(launch.env_value("SUPABASE_ANON_KEY"), Some("anon"));
        assert_eq!(launch.env_value("SUPABASE_DB_URL"), Some("postgres://localhost/db"));

        f.manager.stop().await.unwrap();
        assert!(!f.manager.is_healthy());
        assert_eq!(f.manager.state(), RuntimeState::Stopped);
        assert_eq!(f.controller.terminations(), 1);
        assert_eq!(f.controller.kills(), 0);
        assert_eq!(f.sink.events("runtime.stopped").len(), 1);
    }

    #[tokio::test]
    async fn test_start_never_healthy_times_out() {
        let port = stub_runtime(Arc::new(AtomicBool::new(false))).await;
        let f = fixture(port, FakeBehavior::Normal, |c| {
            c.startup_timeout = Duration::from_millis(300);
        });

        let err = f.manager.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FunctionError::ReadinessTimeout(_)));
        assert!(!f.manager.is_healthy());
        assert_eq!(f.manager.state(), RuntimeState::NotStarted);
        assert_eq!(f.controller.kills(), 1);
        assert_eq!(f.manager.status().unwrap().pid, None);

        // A failed start leaves the manager startable
        assert!(!matches!(
            f.manager.start(&CancellationToken::new()).await,
            Err(FunctionError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_stop_when_never_started() {
        let f = fixture(closed_port().await, FakeBehavior::Normal, |_| {});
        f.manager.stop().await.unwrap();
        assert_eq!(f.manager.state(), RuntimeState::NotStarted);
        assert_eq!(f.controller.terminations(), 0);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let port = stub_runtime(Arc::new(AtomicBool::new(true))).await;
        let f = fixture(port, FakeBehavior::Normal, |_| {});

        f.manager.start(&CancellationToken::new()).await.unwrap();
        assert!(matches!(
            f.manager.start(&CancellationToken::new()).await,
            Err(FunctionError::AlreadyStarted)
        ));
        assert_eq!(f.controller.launches().len(), 1);
        f.manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_during_readiness() {
        let port = stub_runtime(Arc::new(AtomicBool::new(false))).await;
        let f = fixture(port, FakeBehavior::Normal, |_| {});

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = f.manager.start(&cancel).await.unwrap_err();
        assert!(matches!(err, FunctionError::Cancelled));
        assert_eq!(f.manager.state(), RuntimeState::NotStarted);
        assert_eq!(f.controller.kills(), 1);
    }

    #[tokio::test]
    async fn test_dropped_start_restores_state() {
        let port = stub_runtime(Arc::new(AtomicBool::new(false))).await;
        let f = fixture(port, FakeBehavior::Normal, |_| {});

        let cancel = CancellationToken::new();
        let _ = tokio::time::timeout(Duration::from_millis(100), f.manager.start(&cancel)).await;

        assert_eq!(f.manager.state(), RuntimeState::NotStarted);
        assert_eq!(f.manager.status().unwrap().pid, None);
    }

    #[tokio::test]
    async fn test_process_exit_during_startup() {
        let f = fixture(closed_port().await, FakeBehavior::ExitImmediately, |_| {});
        let err = f.manager.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FunctionError::Spawn(_)));
        assert_eq!(f.manager.state(), RuntimeState::NotStarted);
    }

    #[tokio::test]
    async fn test_spawn_failure_restores_state() {
        let f = fixture(closed_port().await, FakeBehavior::FailSpawn, |_| {});
        assert!(matches!(
            f.manager.start(&CancellationToken::new()).await,
            Err(FunctionError::Spawn(_))
        ));
        assert_eq!(f.manager.state(), RuntimeState::NotStarted);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let port = stub_runtime(Arc::new(AtomicBool::new(true))).await;
        let f = fixture(port, FakeBehavior::IgnoreTerminate, |c| {
            c.stop_timeout = Duration::from_millis(100);
        });

        f.manager.start(&CancellationToken::new()).await.unwrap();
        f.manager.stop().await.unwrap();

        assert_eq!(f.controller.terminations(), 1);
        assert_eq!(f.controller.kills(), 1);
        let forced = f.sink.events("runtime.stop.forced");
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].severity, Severity::Warn);
    }

    #[tokio::test]
    async fn test_health_loop_logs_only_transitions() {
        let up = Arc::new(AtomicBool::new(true));
        let port = stub_runtime(up.clone()).await;
        let f = fixture(port, FakeBehavior::Normal, |_| {});

        f.manager.start(&CancellationToken::new()).await.unwrap();

        up.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!f.manager.is_healthy());
        assert_eq!(f.manager.state(), RuntimeState::Unhealthy);
        assert_eq!(f.sink.events("runtime.health.degraded").len(), 1);

        up.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(f.manager.is_healthy());
        assert_eq!(f.manager.state(), RuntimeState::Healthy);
        assert_eq!(f.sink.events("runtime.health.recovered").len(), 1);
        assert_eq!(f.sink.events("runtime.health.degraded").len(), 1);

        f.manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_secrets_apply_on_next_start_only() {
        let port = stub_runtime(Arc::new(AtomicBool::new(true))).await;
        let f = fixture(port, FakeBehavior::Normal, |_| {});

        f.manager.start(&CancellationToken::new()).await.unwrap();
        assert_eq!(f.controller.last_launch().unwrap().env_value("API_KEY"), None);

        f.manager
            .update_secrets(HashMap::from([("API_KEY".to_string(), "v1".to_string())]))
            .unwrap();
        assert_eq!(f.controller.launches().len(), 1);

        f.manager.restart(&CancellationToken::new()).await.unwrap();
        assert_eq!(f.controller.launches().len(), 2);
        assert_eq!(f.controller.last_launch().unwrap().env_value("API_KEY"), Some("v1"));
        f.manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_explicit_binary() {
        let f = fixture(closed_port().await, FakeBehavior::Normal, |c| {
            c.binary_path = Some(PathBuf::from("/nonexistent/edge-runtime"));
        });
        assert!(matches!(
            f.manager.start(&CancellationToken::new()).await,
            Err(FunctionError::BinaryNotFound(_))
        ));
        assert!(f.controller.launches().is_empty());
        assert_eq!(f.manager.state(), RuntimeState::NotStarted);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolves_installed_download_before_search_paths() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture(closed_port().await, FakeBehavior::Normal, |c| {
            c.binary_path = None;
            c.version = "0.0.1".into();
        });
        let dir = &f.manager.config().download_dir;
        std::fs::create_dir_all(dir).unwrap();
        let installed = dir.join("edge-runtime-0.0.1");
        std::fs::write(&installed, b"bin").unwrap();
        std::fs::set_permissions(&installed, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(f.manager.install().await.unwrap(), installed);
    }

    #[tokio::test]
    async fn test_auto_download_refuses_unpinned_release() {
        let f = fixture(closed_port().await, FakeBehavior::Normal, |c| {
            c.binary_path = None;
            c.search_paths = Vec::new();
            c.version = "0.0.2".into();
            c.auto_download = true;
            c.download_base_url = "http://127.0.0.1:9".into();
        });
        if downloader::Platform::current().is_err() {
            return;
        }

        assert!(matches!(
            f.manager.install().await,
            Err(FunctionError::UnpinnedDownload { .. })
        ));
        assert!(!f.manager.config().download_dir.join("edge-runtime-0.0.2").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_find_in_path() {
        use std::os::unix::fs::PermissionsExt;

        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let not_exec = a.path().join(BINARY_NAME);
        std::fs::write(&not_exec, b"x").unwrap();
        std::fs::set_permissions(&not_exec, std::fs::Permissions::from_mode(0o644)).unwrap();
        let exec = b.path().join(BINARY_NAME);
        std::fs::write(&exec, b"x").unwrap();
        std::fs::set_permissions(&exec, std::fs::Permissions::from_mode(0o755)).unwrap();

        let path_var = std::env::join_paths([a.path(), b.path()]).unwrap();
        assert_eq!(find_in_path(BINARY_NAME, &path_var), Some(exec));

        let empty = std::env::join_paths([a.path()]).unwrap();
        assert_eq!(find_in_path(BINARY_NAME, &empty), None);
    }

    #[test]
    fn test_config_debug_hides_secrets() {
        let config = RuntimeConfig {
            secrets: HashMap::from([("API_KEY".to_string(), "sk_live".to_string())]),
            service_role_key: "service-secret".into(),
            ..RuntimeConfig::default()
        };
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("API_KEY"));
        assert!(!rendered.contains("sk_live"));
        assert!(!rendered.contains("service-secret"));
    }
}
