// src/dispatch/pipeline.rs

//! Per-command execution: attempt loop, retry/backoff and terminal
//! bookkeeping.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::dispatch::cancel::{sleep_unless_cancelled, timeout_elapsed, CancelScope};
use crate::dispatch::command::{CommandUnit, ExecutionContext, HandlerResult};
use crate::dispatch::dispatcher::DispatcherInner;
use crate::dispatch::observer::FailureReport;
use crate::dispatch::policy::RetryPolicy;
use crate::errors::HandlerError;
use crate::types::{CancelCause, CommandResult, CommandStatus};

/// How the attempt loop ended.
#[derive(Debug)]
enum Outcome {
    Completed(CommandResult),
    Failed {
        result: CommandResult,
        error: Option<String>,
        retry_count: u32,
    },
    Cancelled(CancelCause),
}

/// How a single attempt ended.
enum AttemptOutcome {
    Returned(HandlerResult),
    /// A token tripped (or the timeout fired) before the handler returned;
    /// the handler future has been dropped.
    Interrupted { timed_out: bool },
}

/// Run one dequeued command to its terminal state.
pub(crate) async fn execute(inner: Arc<DispatcherInner>, unit: CommandUnit) {
    let policy = inner
        .resolver
        .resolve(&unit.operation_name, &unit.metadata)
        .sanitized();

    if !inner.state.mark_running(&unit.run_id, policy.timeout) {
        debug!(
            run_id = %unit.run_id,
            "command is no longer queued (cancelled while waiting); skipping handler"
        );
        return;
    }

    info!(
        run_id = %unit.run_id,
        operation = %unit.operation_name,
        scope = %unit.scope,
        max_attempts = policy.max_attempts,
        timeout_ms = policy.timeout.map(|t| t.as_millis() as u64),
        "command started"
    );
    inner.broadcast();

    let scope = CancelScope::new(inner.pool_token.clone(), unit.cancel.clone());
    let started = Instant::now();
    let outcome = run_attempts(&inner, &unit, &policy, &scope).await;
    let elapsed = started.elapsed();

    match outcome {
        Outcome::Completed(result) => {
            info!(
                run_id = %unit.run_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "command completed: {}",
                result.message
            );
            inner.complete(&unit.run_id, CommandStatus::Completed, result, None);
        }
        Outcome::Failed {
            result,
            error,
            retry_count,
        } => {
            warn!(
                run_id = %unit.run_id,
                retry_count,
                elapsed_ms = elapsed.as_millis() as u64,
                "command failed: {}",
                result.message
            );
            let report = failure_report(&inner, &unit, &result, error, retry_count, elapsed);
            inner.report_failure(report).await;
            inner.complete(&unit.run_id, CommandStatus::Failed, result, None);
        }
        Outcome::Cancelled(cause) => {
            info!(
                run_id = %unit.run_id,
                cause = %cause,
                elapsed_ms = elapsed.as_millis() as u64,
                "command cancelled"
            );
            inner.complete(
                &unit.run_id,
                CommandStatus::Cancelled,
                CommandResult::cancelled(),
                Some(cause),
            );
        }
    }
}

async fn run_attempts(
    inner: &Arc<DispatcherInner>,
    unit: &CommandUnit,
    policy: &RetryPolicy,
    scope: &CancelScope,
) -> Outcome {
    let max_attempts = policy.max_attempts;
    let mut retry_count = 0;
    let mut last_failure = CommandResult::failure("command made no attempts");

    for attempt in 1..=max_attempts {
        if scope.is_cancelled() {
            return Outcome::Cancelled(scope.cause(false));
        }

        let token = scope.attempt_token();
        let ctx = ExecutionContext::new(
            unit,
            attempt,
            max_attempts,
            token.clone(),
            Arc::downgrade(inner),
        );
        debug!(run_id = %unit.run_id, attempt, max_attempts, "invoking handler");

        let handler_future = (unit.handler)(ctx);
        let attempt_outcome = tokio::select! {
            biased;
            _ = token.cancelled() => AttemptOutcome::Interrupted { timed_out: false },
            _ = timeout_elapsed(policy.timeout) => {
                token.cancel();
                AttemptOutcome::Interrupted { timed_out: true }
            }
            result = handler_future => AttemptOutcome::Returned(result),
        };

        let last_attempt = attempt == max_attempts;
        let error_text = match attempt_outcome {
            AttemptOutcome::Returned(Ok(result)) if result.success => {
                return Outcome::Completed(result);
            }
            AttemptOutcome::Returned(Ok(result)) => {
                if !policy.retry_on_failure_result || last_attempt {
                    return Outcome::Failed {
                        result,
                        error: None,
                        retry_count,
                    };
                }
                last_failure = result;
                None
            }
            AttemptOutcome::Returned(Err(HandlerError::Cancelled)) => {
                return Outcome::Cancelled(scope.cause(false));
            }
            AttemptOutcome::Returned(Err(HandlerError::Failed(err))) => {
                let text = format!("{err:#}");
                let result = CommandResult::failure(text.clone());
                if !policy.retry_on_exception || last_attempt {
                    return Outcome::Failed {
                        result,
                        error: Some(text),
                        retry_count,
                    };
                }
                last_failure = result;
                Some(text)
            }
            AttemptOutcome::Interrupted { timed_out } => {
                return Outcome::Cancelled(scope.cause(timed_out));
            }
        };

        retry_count = attempt;
        inner.record_retry(&unit.run_id, retry_count, &last_failure.message);

        let delay = policy.backoff_delay(attempt);
        warn!(
            run_id = %unit.run_id,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = error_text.as_deref().unwrap_or("-"),
            "attempt failed; retrying after backoff: {}",
            last_failure.message
        );

        if !sleep_unless_cancelled(scope.command_token(), delay).await {
            return Outcome::Cancelled(scope.cause(false));
        }
    }

    // max_attempts is always >= 1, so the loop returns before getting here.
    Outcome::Failed {
        result: last_failure,
        error: None,
        retry_count,
    }
}

fn failure_report(
    inner: &DispatcherInner,
    unit: &CommandUnit,
    result: &CommandResult,
    error: Option<String>,
    retry_count: u32,
    execution_time: Duration,
) -> FailureReport {
    // The handler may have renamed the operation while it ran.
    let operation_name = inner
        .state
        .get(&unit.run_id)
        .map(|s| s.operation_name)
        .unwrap_or_else(|| unit.operation_name.clone());

    FailureReport {
        run_id: unit.run_id.clone(),
        operation_name,
        scope: unit.scope.clone(),
        message: result.message.clone(),
        error,
        retry_count,
        execution_time,
        metadata: (*unit.metadata).clone(),
    }
}
