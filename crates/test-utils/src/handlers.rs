//! Scripted handlers for dispatcher tests.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cmddispatch::dispatch::{handler_fn, Handler};
use cmddispatch::types::CommandResult;
use cmddispatch::HandlerError;
use tokio_util::sync::CancellationToken;

/// Always succeeds with `message`.
pub fn succeed(message: &str) -> Handler {
    let message = message.to_string();
    handler_fn(move |_ctx| {
        let message = message.clone();
        async move { Ok(CommandResult::success(message)) }
    })
}

/// Appends `label` to `log` and succeeds.
pub fn record_order(log: Arc<Mutex<Vec<String>>>, label: &str) -> Handler {
    let label = label.to_string();
    handler_fn(move |_ctx| {
        let log = Arc::clone(&log);
        let label = label.clone();
        async move {
            log.lock().unwrap().push(label.clone());
            Ok(CommandResult::success(label))
        }
    })
}

/// Raises an error on the first `failures` calls, then succeeds. `calls`
/// counts every invocation.
pub fn error_then_succeed(failures: u32, calls: Arc<AtomicU32>) -> Handler {
    handler_fn(move |_ctx| {
        let calls = Arc::clone(&calls);
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                Err(HandlerError::msg(format!("boom #{n}")))
            } else {
                Ok(CommandResult::success(format!("ok after {n} calls")))
            }
        }
    })
}

/// Returns a failure result on the first `failures` calls, then succeeds.
pub fn fail_result_then_succeed(failures: u32, calls: Arc<AtomicU32>) -> Handler {
    handler_fn(move |_ctx| {
        let calls = Arc::clone(&calls);
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                Ok(CommandResult::failure(format!("not yet ({n})")))
            } else {
                Ok(CommandResult::success(format!("ok after {n} calls")))
            }
        }
    })
}

/// Returns a failure result on every call.
pub fn always_fail_result(calls: Arc<AtomicU32>) -> Handler {
    handler_fn(move |_ctx| {
        let calls = Arc::clone(&calls);
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(CommandResult::failure(format!("attempt {n} failed")))
        }
    })
}

/// Raises an error on every call.
pub fn always_error(calls: Arc<AtomicU32>) -> Handler {
    handler_fn(move |_ctx| {
        let calls = Arc::clone(&calls);
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(HandlerError::msg(format!("error on attempt {n}")))
        }
    })
}

/// Never returns and never looks at its token. Only the dispatcher dropping
/// the future ends it.
pub fn hang_forever() -> Handler {
    handler_fn(|_ctx| async move {
        std::future::pending::<()>().await;
        Ok(CommandResult::success("unreachable"))
    })
}

/// Waits for its cancellation token and reports `Cancelled`.
pub fn wait_for_cancel() -> Handler {
    handler_fn(|ctx| async move {
        ctx.cancelled().await;
        Err(HandlerError::Cancelled)
    })
}

/// Panics on every call.
pub fn panics(message: &'static str) -> Handler {
    handler_fn(move |_ctx| async move {
        if !message.is_empty() {
            panic!("{message}");
        }
        Ok(CommandResult::success("unreachable"))
    })
}

/// Handler that blocks until the gate is opened. Used to pin a worker while
/// the test arranges the queue.
#[derive(Clone, Default)]
pub struct Gate {
    token: CancellationToken,
    entered: Arc<AtomicUsize>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.token.cancel();
    }

    /// How many handlers have reached the gate.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn handler(&self) -> Handler {
        let gate = self.clone();
        handler_fn(move |_ctx| {
            let gate = gate.clone();
            async move {
                gate.entered.fetch_add(1, Ordering::SeqCst);
                gate.token.cancelled().await;
                Ok(CommandResult::success("gate opened"))
            }
        })
    }
}

/// Tracks how many handlers run at the same time.
#[derive(Clone, Default)]
pub struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_observed(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    /// Handler that holds a slot for `hold` before succeeding.
    pub fn handler(&self, hold: Duration) -> Handler {
        let probe = self.clone();
        handler_fn(move |_ctx| {
            let probe = probe.clone();
            async move {
                let now = probe.current.fetch_add(1, Ordering::SeqCst) + 1;
                probe.max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(hold).await;
                probe.current.fetch_sub(1, Ordering::SeqCst);
                Ok(CommandResult::success("probe done"))
            }
        })
    }
}
