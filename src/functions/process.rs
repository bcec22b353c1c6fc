//! # Process Control
//!
//! The seam between the runtime supervisor and the operating system.
//! `TokioProcessController` spawns real subprocesses; `RecordingController`
//! stands in for tests and records every launch.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;

use super::errors::{FunctionError, FunctionResult};
use crate::observability::{LogSink, Severity};

/// Everything needed to launch a subprocess
#[derive(Clone, Default)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Added on top of the inherited host environment
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    /// Environment variable names, in launch order
    pub fn env_keys(&self) -> Vec<&str> {
        self.env.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

// Values are secrets
impl fmt::Debug for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env_keys())
            .field("cwd", &self.cwd)
            .finish()
    }
}

/// A running subprocess
#[async_trait]
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Whether the process has already exited (non-blocking)
    fn has_exited(&mut self) -> bool;

    /// Ask the process to shut down (SIGTERM)
    async fn terminate(&mut self) -> FunctionResult<()>;

    /// Wait for exit, returning the exit code if there is one
    async fn wait(&mut self) -> FunctionResult<Option<i32>>;

    /// Force the process down (SIGKILL) and reap it
    async fn kill(&mut self) -> FunctionResult<()>;
}

/// Spawns subprocesses
#[async_trait]
pub trait ProcessController: Send + Sync {
    /// Launch `spec`, forwarding stdout lines to `sink` at info and stderr
    /// lines at error.
    async fn start(
        &self,
        spec: &LaunchSpec,
        sink: Arc<dyn LogSink>,
    ) -> FunctionResult<Box<dyn ProcessHandle>>;
}

// ==================
// Tokio
// ==================

/// Real subprocesses via `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessController;

#[async_trait]
impl ProcessController for TokioProcessController {
    async fn start(
        &self,
        spec: &LaunchSpec,
        sink: Arc<dyn LogSink>,
    ) -> FunctionResult<Box<dyn ProcessHandle>> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            FunctionError::Spawn(format!("{}: {}", spec.program.display(), e))
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, sink.clone(), Severity::Info, "runtime.stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, sink, Severity::Error, "runtime.stderr"));
        }

        Ok(Box::new(TokioProcess { child }))
    }
}

/// One sink record per output line until the pipe closes
async fn forward_lines<R>(reader: R, sink: Arc<dyn LogSink>, severity: Severity, event: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        sink.log(severity, event, &[("line", line.as_str())]);
    }
}

struct TokioProcess {
    child: Child,
}

#[async_trait]
impl ProcessHandle for TokioProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    #[cfg(unix)]
    async fn terminate(&mut self) -> FunctionResult<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let status = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status()
            .await?;
        if status.success() || self.has_exited() {
            Ok(())
        } else {
            Err(FunctionError::Internal(format!("kill -TERM {} failed: {}", pid, status)))
        }
    }

    #[cfg(not(unix))]
    async fn terminate(&mut self) -> FunctionResult<()> {
        self.child.start_kill()?;
        Ok(())
    }

    async fn wait(&mut self) -> FunctionResult<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    async fn kill(&mut self) -> FunctionResult<()> {
        if self.has_exited() {
            return Ok(());
        }
        self.child.kill().await?;
        Ok(())
    }
}

// ==================
// Recording double
// ==================

/// How processes launched by a `RecordingController` behave
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FakeBehavior {
    /// Runs until terminated or killed
    #[default]
    Normal,
    /// Only exits on kill
    IgnoreTerminate,
    /// Exits as soon as it is launched
    ExitImmediately,
    /// `start` fails
    FailSpawn,
}

/// Test double that records launches instead of spawning anything
#[derive(Debug, Default)]
pub struct RecordingController {
    behavior: FakeBehavior,
    launches: Mutex<Vec<LaunchSpec>>,
    terminations: Arc<AtomicUsize>,
    kills: Arc<AtomicUsize>,
    next_pid: AtomicU32,
}

impl RecordingController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            ..Self::default()
        }
    }

    /// Every launch so far, oldest first
    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn last_launch(&self) -> Option<LaunchSpec> {
        self.launches().pop()
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessController for RecordingController {
    async fn start(
        &self,
        spec: &LaunchSpec,
        _sink: Arc<dyn LogSink>,
    ) -> FunctionResult<Box<dyn ProcessHandle>> {
        if self.behavior == FakeBehavior::FailSpawn {
            return Err(FunctionError::Spawn(format!(
                "{}: refused by test controller",
                spec.program.display()
            )));
        }
        if let Ok(mut launches) = self.launches.lock() {
            launches.push(spec.clone());
        }

        let (exited, _) = watch::channel(self.behavior == FakeBehavior::ExitImmediately);
        Ok(Box::new(FakeProcess {
            pid: 10_000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
            behavior: self.behavior,
            exited,
            terminations: self.terminations.clone(),
            kills: self.kills.clone(),
        }))
    }
}

struct FakeProcess {
    pid: u32,
    behavior: FakeBehavior,
    exited: watch::Sender<bool>,
    terminations: Arc<AtomicUsize>,
    kills: Arc<AtomicUsize>,
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn has_exited(&mut self) -> bool {
        *self.exited.borrow()
    }

    async fn terminate(&mut self) -> FunctionResult<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if self.behavior != FakeBehavior::IgnoreTerminate {
            self.exited.send_replace(true);
        }
        Ok(())
    }

    async fn wait(&mut self) -> FunctionResult<Option<i32>> {
        let mut rx = self.exited.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        Ok(Some(0))
    }

    async fn kill(&mut self) -> FunctionResult<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.exited.send_replace(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MemorySink;
    use std::time::Duration;

    fn spec(program: &str, args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from(program),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: vec![("API_KEY".into(), "sk_live_123".into())],
            cwd: None,
        }
    }

    #[test]
    fn test_debug_hides_env_values() {
        let rendered = format!("{:?}", spec("edge-runtime", &["start"]));
        assert!(rendered.contains("API_KEY"));
        assert!(!rendered.contains("sk_live_123"));
    }

    #[tokio::test]
    async fn test_recording_controller_records_and_terminates() {
        let controller = RecordingController::new();
        let sink: Arc<dyn LogSink> = Arc::new(MemorySink::new());

        let mut handle = controller.start(&spec("bin", &["a"]), sink).await.unwrap();
        assert!(!handle.has_exited());
        assert_eq!(controller.last_launch().unwrap().env_value("API_KEY"), Some("sk_live_123"));

        handle.terminate().await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), Some(0));
        assert_eq!(controller.terminations(), 1);
        assert_eq!(controller.kills(), 0);
    }

    #[tokio::test]
    async fn test_ignore_terminate_needs_kill() {
        let controller = RecordingController::with_behavior(FakeBehavior::IgnoreTerminate);
        let sink: Arc<dyn LogSink> = Arc::new(MemorySink::new());
        let mut handle = controller.start(&spec("bin", &[]), sink).await.unwrap();

        handle.terminate().await.unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(50), handle.wait()).await;
        assert!(waited.is_err());

        handle.kill().await.unwrap();
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn test_fail_spawn() {
        let controller = RecordingController::with_behavior(FakeBehavior::FailSpawn);
        let sink: Arc<dyn LogSink> = Arc::new(MemorySink::new());
        assert!(matches!(
            controller.start(&spec("bin", &[]), sink).await,
            Err(FunctionError::Spawn(_))
        ));
        assert!(controller.launches().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_controller_forwards_output() {
        let sink = Arc::new(MemorySink::new());
        let mut handle = TokioProcessController
            .start(
                &spec("sh", &["-c", "echo ready; echo failed >&2"]),
                sink.clone(),
            )
            .await
            .unwrap();

        assert_eq!(handle.wait().await.unwrap(), Some(0));
        // Readers finish shortly after exit
        for _ in 0..50 {
            if sink.records().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stdout = sink.events("runtime.stdout");
        let stderr = sink.events("runtime.stderr");
        assert_eq!(stdout[0].field("line"), Some("ready"));
        assert_eq!(stderr[0].severity, Severity::Error);
        assert_eq!(stderr[0].field("line"), Some("failed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_controller_terminates() {
        let sink: Arc<dyn LogSink> = Arc::new(MemorySink::new());
        let mut handle = TokioProcessController
            .start(&spec("sleep", &["30"]), sink)
            .await
            .unwrap();
        assert!(handle.pid().is_some());

        handle.terminate().await.unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();
        // Killed by signal: no exit code
        assert_eq!(code, None);
    }

    #[tokio::test]
    async fn test_tokio_controller_missing_binary() {
        let sink: Arc<dyn LogSink> = Arc::new(MemorySink::new());
        let result = TokioProcessController
            .start(&spec("/nonexistent/edge-runtime", &[]), sink)
            .await;
        assert!(matches!(result, Err(FunctionError::Spawn(_))));
    }
}
