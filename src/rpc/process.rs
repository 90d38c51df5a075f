//! Agent process spawning and control.
//!
//! This module provides a builder for the `pi --mode rpc` command line and
//! an [`AgentProcess`] that owns the child and its three standard streams.
//! Only the owning `AgentProcess` writes to stdin; stdout is handed to a
//! single [`EventReader`](crate::rpc::EventReader) and stderr is drained
//! into the log for the lifetime of the process.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::AgentConfig;
use crate::rpc::reader::drain_stderr;
use crate::rpc::{RpcError, SpawnError};

/// Default agent executable.
pub const DEFAULT_BINARY: &str = "pi";

/// Default time to wait for the agent to exit after stdin is closed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `stop` waits for the stderr drain to finish after exit.
const STDERR_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Builder for the agent's RPC-mode command line.
#[derive(Debug, Clone, Default)]
pub struct AgentProcessBuilder {
    provider: String,
    model: Option<String>,
    no_session: bool,
    session_dir: Option<PathBuf>,
    tools: Option<Vec<String>>,
    extra_args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl AgentProcessBuilder {
    /// Create a new builder for the given LLM provider.
    #[must_use]
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Default::default()
        }
    }

    /// Create a builder from the `[agent]` configuration section.
    #[must_use]
    pub fn from_config(config: &AgentConfig) -> Self {
        let mut builder = Self::new(&config.provider).no_session(config.no_session);
        builder.model.clone_from(&config.model);
        builder.session_dir.clone_from(&config.session_dir);
        builder.tools.clone_from(&config.tools);
        builder.extra_args.clone_from(&config.extra_args);
        builder.working_dir.clone_from(&config.working_dir);
        builder
    }

    /// Set the model ID.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Disable (or re-enable) session persistence.
    #[must_use]
    pub fn no_session(mut self, no_session: bool) -> Self {
        self.no_session = no_session;
        self
    }

    /// Set a custom session storage directory.
    #[must_use]
    pub fn session_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.session_dir = Some(dir.into());
        self
    }

    /// Restrict the agent to the given tools.
    #[must_use]
    pub fn tools(mut self, tools: &[&str]) -> Self {
        self.tools = Some(tools.iter().map(|s| (*s).to_string()).collect());
        self
    }

    /// Append extra command-line arguments.
    #[must_use]
    pub fn extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory for the agent process.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Get the working directory, if set.
    #[must_use]
    pub fn get_working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    /// Get the provider.
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Build the command-line arguments.
    #[must_use]
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "--mode".to_string(),
            "rpc".to_string(),
            "--provider".to_string(),
            self.provider.clone(),
        ];

        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if self.no_session {
            args.push("--no-session".to_string());
        }

        if let Some(dir) = &self.session_dir {
            args.push("--session-dir".to_string());
            args.push(dir.display().to_string());
        }

        if let Some(tools) = &self.tools {
            args.push("--tools".to_string());
            args.push(tools.join(","));
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// A running agent process.
///
/// Dropping the process kills the child.
#[derive(Debug)]
pub struct AgentProcess {
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Option<ChildStdout>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
    pid: Option<u32>,
    stop_timeout: Duration,
}

impl AgentProcess {
    /// Spawn the default agent binary with the given builder configuration.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the process fails to spawn.
    pub fn spawn(builder: &AgentProcessBuilder) -> Result<Self, SpawnError> {
        Self::spawn_with_binary(DEFAULT_BINARY, builder)
    }

    /// Spawn a process using a custom binary.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the process fails to spawn.
    pub fn spawn_with_binary(
        binary: &str,
        builder: &AgentProcessBuilder,
    ) -> Result<Self, SpawnError> {
        let mut cmd = Command::new(binary);
        cmd.args(builder.build_args());

        if let Some(ref dir) = builder.working_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(binary, args = ?builder.build_args(), "Spawning agent");
        Self::spawn_command(binary, cmd)
    }

    /// Spawn an arbitrary program speaking the RPC protocol (used for scripted agents).
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the process fails to spawn.
    pub fn spawn_raw<I, S>(program: &str, args: I) -> Result<Self, SpawnError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(program);
        cmd.args(args);
        Self::spawn_command(program, cmd)
    }

    fn spawn_command(binary: &str, mut cmd: Command) -> Result<Self, SpawnError> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SpawnError::from_io(binary, e))?;

        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;
        let pid = child.id();

        let stderr_task = tokio::spawn(drain_stderr(stderr, pid));

        tracing::info!(binary, pid = ?pid, "Agent process started");

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            stdout: Some(stdout),
            stderr_task: Mutex::new(Some(stderr_task)),
            pid,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        })
    }

    /// Set how long `stop` waits before terminating the process.
    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Take ownership of the stdout handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Get the process ID captured at spawn time.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Append one line to the agent's stdin and flush it.
    ///
    /// A trailing newline is added if missing. Concurrent writers are
    /// serialized so lines never interleave.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::StreamClosed` if stdin was closed or the process exited.
    pub async fn write_line(&self, line: &str) -> Result<(), RpcError> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(RpcError::StreamClosed);
        };

        if !self.is_running().await {
            return Err(RpcError::StreamClosed);
        }

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(RpcError::from_write)?;
        if !line.ends_with('\n') {
            stdin.write_all(b"\n").await.map_err(RpcError::from_write)?;
        }
        stdin.flush().await.map_err(RpcError::from_write)?;
        Ok(())
    }

    /// Check whether the process has not exited yet, without blocking.
    pub async fn is_running(&self) -> bool {
        match self.child.lock().await.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(e) => {
                tracing::warn!(pid = ?self.pid, error = %e, "Failed to query agent status");
                false
            }
        }
    }

    /// Close stdin and wait for the process to exit.
    ///
    /// Idempotent: calling it after the process has exited returns
    /// immediately. If the process does not exit within the stop timeout it
    /// is terminated.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting on or terminating the process fails.
    pub async fn stop(&self) -> Result<Option<ExitStatus>, RpcError> {
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(pid = ?self.pid, error = %e, "Agent stdin already closed");
            }
        }

        let status = {
            let mut child = self.child.lock().await;
            match tokio::time::timeout(self.stop_timeout, child.wait()).await {
                Ok(status) => Some(status?),
                Err(_) => {
                    tracing::warn!(
                        pid = ?self.pid,
                        timeout_ms = u64::try_from(self.stop_timeout.as_millis()).unwrap_or(u64::MAX),
                        "Agent did not exit after stdin closed, terminating"
                    );
                    graceful_terminate(&mut child, self.stop_timeout).await?;
                    child.try_wait()?
                }
            }
        };

        if let Some(task) = self.stderr_task.lock().await.take() {
            let _ = tokio::time::timeout(STDERR_FLUSH_TIMEOUT, task).await;
        }

        tracing::info!(pid = ?self.pid, status = ?status, "Agent process stopped");
        Ok(status)
    }
}

/// Attempt graceful termination with a timeout.
///
/// On Unix, sends SIGTERM first, then SIGKILL after the timeout.
/// On other platforms, falls back to immediate kill.
async fn graceful_terminate(child: &mut Child, timeout: Duration) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let nix_pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
            let _ = kill(nix_pid, Signal::SIGTERM);

            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(_) => child.kill().await,
            }
        } else {
            // Process already exited
            Ok(())
        }
    }

    #[cfg(not(unix))]
    {
        let _ = timeout;
        child.kill().await
    }
}
