//! Observer implementations that remember what they were given.

use std::sync::{Arc, Mutex};

use cmddispatch::dispatch::observer::BoxFuture;
use cmddispatch::dispatch::{CommandSnapshot, FailureReport, FailureReporter, SnapshotBroadcaster};
use cmddispatch::types::CommandStatus;

/// Keeps every published snapshot list.
#[derive(Default)]
pub struct RecordingBroadcaster {
    published: Mutex<Vec<Vec<CommandSnapshot>>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish_count(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    pub fn latest(&self) -> Option<Vec<CommandSnapshot>> {
        self.published.lock().unwrap().last().cloned()
    }

    /// Whether any published list showed `run_id` in `status`.
    pub fn saw_status(&self, run_id: &str, status: CommandStatus) -> bool {
        self.published
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .any(|s| s.run_id == run_id && s.status == status)
    }

    /// Every progress step published for `run_id`, in order, without
    /// consecutive duplicates.
    pub fn steps_for(&self, run_id: &str) -> Vec<u32> {
        let mut steps: Vec<u32> = self
            .published
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .filter(|s| s.run_id == run_id)
            .filter_map(|s| s.current_step)
            .collect();
        steps.dedup();
        steps
    }
}

impl SnapshotBroadcaster for RecordingBroadcaster {
    fn publish(&self, snapshots: Vec<CommandSnapshot>) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.published.lock().unwrap().push(snapshots);
            Ok(())
        })
    }
}

/// Broadcaster that always errors.
#[derive(Default)]
pub struct FailingBroadcaster;

impl SnapshotBroadcaster for FailingBroadcaster {
    fn publish(&self, _snapshots: Vec<CommandSnapshot>) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move { Err(anyhow::anyhow!("broadcast channel closed")) })
    }
}

/// Keeps every failure report.
#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<FailureReport>>,
}

impl RecordingReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reports(&self) -> Vec<FailureReport> {
        self.reports.lock().unwrap().clone()
    }
}

impl FailureReporter for RecordingReporter {
    fn report(&self, report: FailureReport) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.reports.lock().unwrap().push(report);
            Ok(())
        })
    }
}
