//! Command node runner.
//!
//! Shell execution goes through the [`ProcessRunner`] port. The tokio
//! implementation streams stdout/stderr line by line (re-emitted as tracing
//! events for live display) while capturing the full text, and terminates
//! timed-out or cancelled commands with SIGTERM, then SIGKILL after a grace
//! period. Interactive commands inherit the terminal; capture degrades to
//! nothing and only the exit code is recorded.

use crate::runner::{Outcome, OutcomeStatus, RenderedAction, RunContext, Runner};
use crate::status::Decision;
use async_trait::async_trait;
use opsrun_runbook::NodeDescriptor;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A request to execute one shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    /// The command line, passed to the shell via `-c`.
    pub command: String,
    /// Inherit the terminal instead of capturing output.
    pub interactive: bool,
    /// Wall-clock budget for the process.
    pub timeout: Option<Duration>,
    /// How long to wait between SIGTERM and SIGKILL.
    pub grace: Duration,
}

/// What a finished (or killed) process left behind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessOutput {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// Errors from the process port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The process could not be spawned.
    SpawnFailed { command: String, message: String },
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpawnFailed { command, message } => {
                write!(f, "cannot spawn '{command}': {message}")
            }
        }
    }
}

impl std::error::Error for ProcessError {}

/// Port for shell subprocess primitives.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs a command to completion, honoring cancellation and timeout.
    async fn run(
        &self,
        request: ProcessRequest,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessError>;
}

/// The real process runner, backed by `tokio::process`.
pub struct TokioProcessRunner {
    shell: String,
}

impl TokioProcessRunner {
    /// Creates a runner using `/bin/sh`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
        }
    }

    /// Overrides the shell binary.
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

impl Default for TokioProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        request: ProcessRequest,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessError> {
        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.arg("-c").arg(&request.command).kill_on_drop(true);
        if request.interactive {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            command: request.command.clone(),
            message: e.to_string(),
        })?;

        let stdout_task = child
            .stdout
            .take()
            .map(|stream| tokio::spawn(capture_lines(stream, "stdout")));
        let stderr_task = child
            .stderr
            .take()
            .map(|stream| tokio::spawn(capture_lines(stream, "stderr")));

        let timeout = async {
            match request.timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };

        let mut output = ProcessOutput::default();
        let mut exited = None;
        tokio::select! {
            status = child.wait() => exited = status.ok(),
            () = cancel.cancelled() => output.cancelled = true,
            () = timeout => output.timed_out = true,
        }
        let status = if output.cancelled || output.timed_out {
            terminate(&mut child, request.grace).await
        } else {
            exited
        };

        output.exit_code = status.and_then(|s| s.code()).map(i64::from);
        if let Some(task) = stdout_task {
            output.stdout = task.await.unwrap_or_default();
        }
        if let Some(task) = stderr_task {
            output.stderr = task.await.unwrap_or_default();
        }
        Ok(output)
    }
}

/// Reads a stream to the end, echoing each line as a tracing event.
async fn capture_lines(stream: impl AsyncRead + Unpin, label: &'static str) -> String {
    let mut captured = String::new();
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "opsrun::process", stream = label, "{line}");
        captured.push_str(&line);
        captured.push('\n');
    }
    captured
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child, grace: Duration) -> Option<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(waited) => waited.ok(),
        Err(_) => {
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    }
}

/// Runner for command nodes.
pub struct CommandRunner {
    process: Arc<dyn ProcessRunner>,
    grace: Duration,
}

impl CommandRunner {
    /// Creates a command runner over a process port.
    #[must_use]
    pub fn new(process: Arc<dyn ProcessRunner>) -> Self {
        Self {
            process,
            grace: Duration::from_secs(5),
        }
    }

    /// Overrides the SIGTERM-to-SIGKILL grace period.
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[async_trait]
impl Runner for CommandRunner {
    async fn run(
        &self,
        ctx: &RunContext,
        _node: &NodeDescriptor,
        action: &RenderedAction,
    ) -> Outcome {
        let RenderedAction::Command {
            command,
            interactive,
        } = action
        else {
            return Outcome::nok("command runner invoked for a non-command node");
        };

        let request = ProcessRequest {
            command: command.clone(),
            interactive: *interactive,
            timeout: ctx.timeout,
            grace: self.grace,
        };

        let output = match self.process.run(request, &ctx.cancel).await {
            Ok(output) => output,
            Err(e) => return Outcome::nok(format!("process_failed: {e}")),
        };

        let (status, exception) = if output.cancelled {
            (OutcomeStatus::Nok, Some("cancelled".to_string()))
        } else if output.timed_out {
            (OutcomeStatus::Nok, Some("timeout".to_string()))
        } else if output.exit_code == Some(0) {
            (OutcomeStatus::Ok, None)
        } else {
            (OutcomeStatus::Nok, None)
        };

        Outcome {
            status,
            decision: Decision::None,
            result_text: None,
            exit_code: output.exit_code,
            exception,
            stdout: (!output.stdout.is_empty()).then_some(output.stdout),
            stderr: (!output.stderr.is_empty()).then_some(output.stderr),
        }
    }
}
