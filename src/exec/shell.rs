// src/exec/shell.rs

//! Shell command handler.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::command::{handler_fn, ExecutionContext, Handler, HandlerResult};
use crate::errors::HandlerError;
use crate::exec::progress::ProgressPattern;
use crate::types::CommandResult;

/// How long to wait for the output readers once the process has exited.
/// Grandchildren that inherited the pipes can keep them open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// A shell command line run as a dispatcher handler.
///
/// - Exit status 0 is a success result.
/// - Any other exit is a failure result carrying the last stderr line, so
///   `retry_on_failure_result` decides whether it is retried.
/// - Failing to spawn the process is a handler error (`retry_on_exception`).
/// - Cancellation kills the child and reports `HandlerError::Cancelled`.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    cmd: String,
    progress: Option<ProgressPattern>,
}

impl ShellCommand {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            progress: None,
        }
    }

    /// Report progress for stdout lines matching `pattern`.
    pub fn with_progress(mut self, pattern: ProgressPattern) -> Self {
        self.progress = Some(pattern);
        self
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    pub fn into_handler(self) -> Handler {
        let this = Arc::new(self);
        handler_fn(move |ctx| {
            let this = Arc::clone(&this);
            async move { this.run(ctx).await }
        })
    }

    /// Run one attempt.
    pub async fn run(&self, ctx: ExecutionContext) -> HandlerResult {
        info!(
            run_id = %ctx.run_id(),
            attempt = ctx.attempt(),
            cmd = %self.cmd,
            "starting process"
        );

        // Build a shell command appropriate for the platform.
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&self.cmd);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&self.cmd);
            c
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning process for `{}`", self.cmd))?;

        let stdout = child
            .stdout
            .take()
            .map(|out| spawn_stdout_monitor(out, ctx.clone(), self.progress.clone()));
        let stderr = child
            .stderr
            .take()
            .map(|err| spawn_stderr_drain(err, ctx.run_id().to_string()));

        let waited = tokio::select! {
            biased;
            _ = ctx.cancelled() => None,
            status = child.wait() => Some(status),
        };

        let Some(status) = waited else {
            if let Err(e) = child.kill().await {
                warn!(run_id = %ctx.run_id(), error = %e, "failed to kill cancelled process");
            }
            for reader in [stdout, stderr].into_iter().flatten() {
                reader.abort();
            }
            info!(run_id = %ctx.run_id(), "process killed after cancellation");
            return Err(HandlerError::Cancelled);
        };

        let status = status.with_context(|| format!("waiting for process `{}`", self.cmd))?;
        let last_stdout = drain(stdout).await;
        let last_stderr = drain(stderr).await;

        info!(
            run_id = %ctx.run_id(),
            exit_code = ?status.code(),
            success = status.success(),
            "process exited"
        );

        if status.success() {
            let message = last_stdout.unwrap_or_else(|| format!("`{}` finished", self.cmd));
            return Ok(CommandResult::success(message));
        }

        let exit = match status.code() {
            Some(code) => format!("exited with code {code}"),
            None => "terminated by signal".to_string(),
        };
        let message = match last_stderr {
            Some(line) => format!("{exit}: {line}"),
            None => exit,
        };
        Ok(CommandResult::failure(message))
    }
}

/// Read stdout line by line, forwarding progress matches. Yields the last
/// non-empty line.
fn spawn_stdout_monitor<R>(
    stdout: R,
    ctx: ExecutionContext,
    progress: Option<ProgressPattern>,
) -> JoinHandle<Option<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let mut last = None;

        while let Ok(Some(line)) = lines.next_line().await {
            debug!(run_id = %ctx.run_id(), "stdout: {}", line);

            if let Some(update) = progress.as_ref().and_then(|p| p.parse(&line)) {
                ctx.report_progress(
                    update.current_step,
                    update.max_step,
                    update.description.as_deref(),
                );
            }
            if !line.trim().is_empty() {
                last = Some(line);
            }
        }
        last
    })
}

/// Always consume stderr so buffers don't fill; log at debug. Yields the
/// last non-empty line.
fn spawn_stderr_drain<R>(stderr: R, run_id: String) -> JoinHandle<Option<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut last = None;

        while let Ok(Some(line)) = lines.next_line().await {
            debug!(run_id = %run_id, "stderr: {}", line);
            if !line.trim().is_empty() {
                last = Some(line);
            }
        }
        last
    })
}

async fn drain(reader: Option<JoinHandle<Option<String>>>) -> Option<String> {
    let mut reader = reader?;
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut reader).await {
        Ok(Ok(last)) => last,
        Ok(Err(e)) => {
            warn!(error = %e, "output reader task failed");
            None
        }
        Err(_) => {
            reader.abort();
            None
        }
    }
}
