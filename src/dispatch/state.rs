// src/dispatch/state.rs

//! Lifecycle state store.
//!
//! Two maps keyed by run id: `active` holds queued and running commands,
//! `completed` holds finished ones until their retention window expires.
//! A command moves from one to the other exactly once.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dispatch::completion::CompletionSignal;
use crate::dispatch::lock;
use crate::types::{CancelCause, CommandResult, CommandStatus};

/// Mutable record for one command.
#[derive(Debug, Clone)]
pub struct CommandState {
    pub run_id: String,
    pub operation_name: String,
    pub scope: String,
    pub priority: u8,
    pub sequence: u64,
    pub status: CommandStatus,
    pub metadata: Arc<BTreeMap<String, String>>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_step: Option<u32>,
    pub max_step: Option<u32>,
    pub step_description: Option<String>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub timeout: Option<Duration>,
    pub cancel_cause: Option<CancelCause>,
    pub result: Option<CommandResult>,
    pub(crate) cancel: CancellationToken,
    pub(crate) completion: CompletionSignal,
}

impl CommandState {
    pub fn snapshot(&self) -> CommandSnapshot {
        CommandSnapshot {
            run_id: self.run_id.clone(),
            operation_name: self.operation_name.clone(),
            scope: self.scope.clone(),
            status: self.status,
            priority: self.priority,
            sequence: self.sequence,
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            metadata: (*self.metadata).clone(),
            current_step: self.current_step,
            max_step: self.max_step,
            step_description: self.step_description.clone(),
            retry_count: self.retry_count,
            error_message: self.error_message.clone(),
            timeout_seconds: self.timeout.map(|t| t.as_secs_f64()),
        }
    }
}

/// Immutable, serializable view of a command, as published to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSnapshot {
    pub run_id: String,
    pub operation_name: String,
    pub scope: String,
    pub status: CommandStatus,
    pub priority: u8,
    #[serde(skip)]
    pub sequence: u64,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
    pub current_step: Option<u32>,
    pub max_step: Option<u32>,
    pub step_description: Option<String>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub timeout_seconds: Option<f64>,
}

/// Outcome of asking the store to cancel a command.
#[derive(Debug, Clone)]
pub enum CancelRequest {
    /// Unknown or already finished.
    NotFound,
    /// Was still queued; it is now terminal and moved to the completed map.
    CancelledWhileQueued(FinishedCommand),
    /// Is running; its token has been tripped.
    SignalledRunning,
}

/// What the store hands back when a command reaches its terminal state.
#[derive(Debug, Clone)]
pub struct FinishedCommand {
    pub run_id: String,
    pub sequence: u64,
    pub operation_name: String,
    pub status: CommandStatus,
    pub result: CommandResult,
    pub metadata: BTreeMap<String, String>,
    pub(crate) completion: CompletionSignal,
}

#[derive(Debug, Default)]
pub struct StateStore {
    active: Mutex<HashMap<String, CommandState>>,
    completed: Mutex<HashMap<String, CommandState>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly queued command.
    ///
    /// Returns `false` if the run id is already active.
    pub fn insert_queued(&self, state: CommandState) -> bool {
        let mut active = lock(&self.active);
        if active.contains_key(&state.run_id) {
            return false;
        }
        // A reused run id replaces whatever finished entry is still retained.
        lock(&self.completed).remove(&state.run_id);
        active.insert(state.run_id.clone(), state);
        true
    }

    pub fn contains_active(&self, run_id: &str) -> bool {
        lock(&self.active).contains_key(run_id)
    }

    /// `Queued -> Running`. Returns `false` if the command is gone or no
    /// longer queued (e.g. cancelled while it waited).
    pub fn mark_running(&self, run_id: &str, timeout: Option<Duration>) -> bool {
        let mut active = lock(&self.active);
        match active.get_mut(run_id) {
            Some(state) if state.status == CommandStatus::Queued => {
                state.status = CommandStatus::Running;
                state.started_at = Some(Utc::now());
                state.timeout = timeout;
                true
            }
            _ => false,
        }
    }

    /// Apply `f` to an active command. Returns `false` if not found.
    pub fn update_active(&self, run_id: &str, f: impl FnOnce(&mut CommandState)) -> bool {
        match lock(&self.active).get_mut(run_id) {
            Some(state) => {
                f(state);
                true
            }
            None => false,
        }
    }

    /// Cancel a command by run id: queued commands finish right here,
    /// running ones get their token tripped.
    pub fn request_cancel(&self, run_id: &str) -> CancelRequest {
        let mut active = lock(&self.active);
        let status = match active.get(run_id) {
            Some(state) => state.status,
            None => return CancelRequest::NotFound,
        };

        match status {
            CommandStatus::Queued => {
                let Some(mut state) = active.remove(run_id) else {
                    return CancelRequest::NotFound;
                };
                state.cancel.cancel();
                let finished = seal(
                    &mut state,
                    CommandStatus::Cancelled,
                    CommandResult::cancelled(),
                    Some(CancelCause::Manual),
                );
                lock(&self.completed).insert(state.run_id.clone(), state);
                CancelRequest::CancelledWhileQueued(finished)
            }
            CommandStatus::Running => {
                if let Some(state) = active.get(run_id) {
                    state.cancel.cancel();
                }
                CancelRequest::SignalledRunning
            }
            // Terminal entries never live in the active map.
            _ => CancelRequest::NotFound,
        }
    }

    /// Run ids of every queued or running command.
    pub fn active_run_ids(&self) -> Vec<String> {
        lock(&self.active).keys().cloned().collect()
    }

    /// Move a command to its terminal state and into the completed map.
    ///
    /// Returns `None` if the command is not active or the transition would go
    /// backwards; the caller must then skip all completion side effects.
    pub fn finish(
        &self,
        run_id: &str,
        status: CommandStatus,
        result: CommandResult,
        cause: Option<CancelCause>,
    ) -> Option<FinishedCommand> {
        let mut active = lock(&self.active);
        let current = active.get(run_id)?.status;
        if !current.can_transition_to(status) {
            warn!(
                run_id = %run_id,
                from = %current,
                to = %status,
                "refusing backwards status transition"
            );
            return None;
        }

        let mut state = active.remove(run_id)?;
        let finished = seal(&mut state, status, result, cause);
        lock(&self.completed).insert(state.run_id.clone(), state);
        Some(finished)
    }

    /// Completion signal for a command that is active or still retained.
    pub fn completion(&self, run_id: &str) -> Option<CompletionSignal> {
        if let Some(state) = lock(&self.active).get(run_id) {
            return Some(state.completion.clone());
        }
        lock(&self.completed).get(run_id).map(|s| s.completion.clone())
    }

    /// Drop a finished command from the completed map.
    ///
    /// `sequence` guards against evicting a newer command that reused the
    /// same run id.
    pub fn evict(&self, run_id: &str, sequence: u64) -> bool {
        let mut completed = lock(&self.completed);
        let removed = match completed.get(run_id) {
            Some(state) if state.sequence == sequence => completed.remove(run_id).is_some(),
            _ => false,
        };
        if removed {
            debug!(run_id = %run_id, "evicted finished command");
        }
        removed
    }

    pub fn get(&self, run_id: &str) -> Option<CommandSnapshot> {
        if let Some(state) = lock(&self.active).get(run_id) {
            return Some(state.snapshot());
        }
        lock(&self.completed).get(run_id).map(CommandState::snapshot)
    }

    /// All active and retained commands, oldest enqueue first.
    pub fn snapshots(&self) -> Vec<CommandSnapshot> {
        let mut out: Vec<CommandSnapshot> = lock(&self.active)
            .values()
            .map(CommandState::snapshot)
            .collect();
        out.extend(lock(&self.completed).values().map(CommandState::snapshot));
        out.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        out
    }

    pub fn active_len(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn completed_len(&self) -> usize {
        lock(&self.completed).len()
    }
}

fn seal(
    state: &mut CommandState,
    status: CommandStatus,
    result: CommandResult,
    cause: Option<CancelCause>,
) -> FinishedCommand {
    state.status = status;
    state.completed_at = Some(Utc::now());
    state.cancel_cause = cause;
    state.error_message = if result.success {
        None
    } else {
        Some(result.message.clone())
    };
    state.result = Some(result.clone());

    FinishedCommand {
        run_id: state.run_id.clone(),
        sequence: state.sequence,
        operation_name: state.operation_name.clone(),
        status,
        result,
        metadata: (*state.metadata).clone(),
        completion: state.completion.clone(),
    }
}
