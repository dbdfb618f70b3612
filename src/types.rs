use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a command.
///
/// Transitions only move forward: `Queued -> Running -> terminal`, or
/// `Queued -> Cancelled` when a command is cancelled before a worker picks
/// it up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` respects the forward-only rule.
    pub fn can_transition_to(self, next: CommandStatus) -> bool {
        match self {
            CommandStatus::Queued => {
                matches!(next, CommandStatus::Running | CommandStatus::Cancelled)
            }
            CommandStatus::Running => next.is_terminal(),
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled => false,
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandStatus::Queued => "queued",
            CommandStatus::Running => "running",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for CommandStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "queued" => Ok(CommandStatus::Queued),
            "running" => Ok(CommandStatus::Running),
            "completed" => Ok(CommandStatus::Completed),
            "failed" => Ok(CommandStatus::Failed),
            "cancelled" | "canceled" => Ok(CommandStatus::Cancelled),
            other => Err(format!("invalid command status: {other}")),
        }
    }
}

/// Final outcome of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
}

/// Caller-visible message for every cancelled command, whatever the cause.
pub const CANCELLED_MESSAGE: &str = "Operation cancelled";

impl CommandResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::failure(CANCELLED_MESSAGE)
    }

    pub fn not_found(run_id: &str) -> Self {
        Self::failure(format!("Command '{run_id}' not found"))
    }
}

/// Why a command ended up cancelled. Recorded for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelCause {
    /// The worker pool was stopped.
    Shutdown,
    /// `cancel` / `cancel_all` was called for this command.
    Manual,
    /// The per-attempt timeout elapsed.
    Timeout,
    /// The handler reported cancellation on its own.
    Other,
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancelCause::Shutdown => "shutdown",
            CancelCause::Manual => "manual",
            CancelCause::Timeout => "timeout",
            CancelCause::Other => "other",
        };
        f.write_str(s)
    }
}
