// src/dispatch/worker.rs

//! Worker loop.
//!
//! Each worker waits for a scheduling permit, takes the most urgent queued
//! command and runs it to completion before looking at the queue again. The
//! pipeline runs in its own Tokio task so that a panic inside a handler is
//! contained: the worker logs it, fails the command and carries on.

use std::any::Any;
use std::sync::Arc;

use tokio::task::JoinError;
use tracing::{debug, error, info};

use crate::dispatch::dispatcher::DispatcherInner;
use crate::dispatch::pipeline;

pub(crate) async fn run_worker(inner: Arc<DispatcherInner>, worker_id: usize) {
    let shutdown = inner.pool_token.clone();
    info!(worker_id, "worker started");

    loop {
        let acquired = tokio::select! {
            biased;
            _ = shutdown.cancelled() => false,
            acquired = inner.queue.acquire() => acquired,
        };
        if !acquired {
            break;
        }

        let Some(entry) = inner.queue.pop() else {
            debug!(worker_id, "permit without a queued item; waiting again");
            continue;
        };

        let run_id = entry.payload.run_id.clone();
        debug!(
            worker_id,
            run_id = %run_id,
            priority = entry.priority,
            sequence = entry.sequence,
            "dequeued command"
        );

        let task = tokio::spawn(pipeline::execute(Arc::clone(&inner), entry.payload));
        if let Err(err) = task.await {
            let reason = join_error_message(err);
            error!(worker_id, run_id = %run_id, reason = %reason, "command pipeline aborted");
            inner.abandon(&run_id, reason).await;
        }
    }

    info!(worker_id, "worker stopped");
}

fn join_error_message(err: JoinError) -> String {
    if err.is_panic() {
        format!("command handler panicked: {}", panic_text(err.into_panic()))
    } else {
        format!("command pipeline aborted: {err}")
    }
}

fn panic_text(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
