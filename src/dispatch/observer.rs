// src/dispatch/observer.rs

//! Collaborators that observe the dispatcher.
//!
//! - [`SnapshotBroadcaster`] receives the full snapshot list whenever visible
//!   state changes. Calls are spawned and never awaited by the dispatcher.
//! - [`FailureReporter`] is told about every command that ends `Failed`
//!   (never about cancellations).
//! - Completion subscribers are plain callbacks fired once per finished
//!   command.
//!
//! Errors from any of these are logged and otherwise ignored.

use std::collections::BTreeMap;
use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::dispatch::lock;
use crate::dispatch::state::CommandSnapshot;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Receives snapshot lists for UI / telemetry.
pub trait SnapshotBroadcaster: Send + Sync {
    fn publish(&self, snapshots: Vec<CommandSnapshot>) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Structured context about a failed command.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub run_id: String,
    pub operation_name: String,
    /// Logical grouping label of the command.
    pub scope: String,
    pub message: String,
    /// Text of the handler error, when the last attempt raised one.
    pub error: Option<String>,
    pub retry_count: u32,
    pub execution_time: Duration,
    /// Correlation ids and other caller metadata.
    pub metadata: BTreeMap<String, String>,
}

/// Best-effort sink for failed commands.
pub trait FailureReporter: Send + Sync {
    fn report(&self, report: FailureReport) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Fired once per command when it reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub run_id: String,
    pub operation_name: String,
    pub success: bool,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
}

pub type CompletionSubscriber = Arc<dyn Fn(&CompletionEvent) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by `Dispatcher::subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

/// Broadcaster that only logs how many commands are visible.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingBroadcaster;

impl SnapshotBroadcaster for LoggingBroadcaster {
    fn publish(&self, snapshots: Vec<CommandSnapshot>) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let running = snapshots
                .iter()
                .filter(|s| s.status == crate::types::CommandStatus::Running)
                .count();
            debug!(visible = snapshots.len(), running, "command snapshot");
            Ok(())
        })
    }
}

/// Broadcaster writing each snapshot list as one JSON line.
pub struct JsonLinesBroadcaster<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesBroadcaster<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl JsonLinesBroadcaster<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> SnapshotBroadcaster for JsonLinesBroadcaster<W> {
    fn publish(&self, snapshots: Vec<CommandSnapshot>) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let line = serde_json::to_string(&snapshots)?;
            let mut out = lock(&self.out);
            writeln!(out, "{line}")?;
            out.flush()?;
            Ok(())
        })
    }
}

/// Reporter that logs failures at `warn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingFailureReporter;

impl FailureReporter for LoggingFailureReporter {
    fn report(&self, report: FailureReport) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            warn!(
                run_id = %report.run_id,
                operation = %report.operation_name,
                scope = %report.scope,
                retry_count = report.retry_count,
                execution_ms = report.execution_time.as_millis() as u64,
                error = report.error.as_deref().unwrap_or("-"),
                "command failed: {}",
                report.message
            );
            Ok(())
        })
    }
}
