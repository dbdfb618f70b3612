// src/dispatch/cancel.rs

//! Cancellation context.
//!
//! Tokens form a hierarchy: the pool token (lives as long as the worker
//! pool) is the parent of every command token, and each attempt derives its
//! own child token from the command token. Cancelling a parent trips all
//! of its descendants, so a checkpoint only ever needs to look at the
//! nearest token it was handed.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::types::CancelCause;

/// Tokens involved in running one command.
#[derive(Debug, Clone)]
pub struct CancelScope {
    pool: CancellationToken,
    command: CancellationToken,
}

impl CancelScope {
    pub fn new(pool: CancellationToken, command: CancellationToken) -> Self {
        Self { pool, command }
    }

    pub fn command_token(&self) -> &CancellationToken {
        &self.command
    }

    pub fn is_cancelled(&self) -> bool {
        self.command.is_cancelled()
    }

    /// Token for a single attempt; tripped by the command token and, if the
    /// caller arms it, by the attempt timeout.
    pub fn attempt_token(&self) -> CancellationToken {
        self.command.child_token()
    }

    /// Attribute a cancellation to its most likely cause.
    ///
    /// Pool shutdown wins over a manual cancel because it also trips every
    /// command token.
    pub fn cause(&self, timed_out: bool) -> CancelCause {
        if self.pool.is_cancelled() {
            CancelCause::Shutdown
        } else if self.command.is_cancelled() {
            CancelCause::Manual
        } else if timed_out {
            CancelCause::Timeout
        } else {
            CancelCause::Other
        }
    }
}

/// Sleep for `delay` unless `token` trips first.
///
/// Returns `true` if the full delay elapsed.
pub async fn sleep_unless_cancelled(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Resolves after `timeout`, or never when there is none.
pub async fn timeout_elapsed(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending::<()>().await,
    }
}
