// src/dispatch/mod.rs

//! In-process command dispatcher.
//!
//! - [`queue`] orders pending work by priority, then arrival.
//! - `worker` runs the fixed pool of worker loops.
//! - `pipeline` runs one command: attempts, retries, backoff, cancellation.
//! - [`state`] tracks lifecycle state and produces snapshots.
//! - [`cancel`] holds the cancellation token hierarchy helpers.
//! - [`completion`] is the one-shot completion signal.
//! - [`policy`] resolves retry/timeout/backoff policies.
//! - [`observer`] defines broadcaster / failure-reporter / subscriber seams.
//! - [`dispatcher`] ties it all together behind [`Dispatcher`].

pub mod cancel;
pub mod command;
pub mod completion;
pub mod dispatcher;
pub mod observer;
mod pipeline;
pub mod policy;
pub mod queue;
pub mod state;
mod worker;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use command::{
    handler_fn, CommandHandle, CommandUnit, EnqueueRequest, ExecutionContext, Handler,
    HandlerResult, DEFAULT_OPERATION, DEFAULT_PRIORITY,
};
pub use completion::{CompletionFuture, CompletionSignal};
pub use dispatcher::{Dispatcher, DispatcherBuilder, DispatcherOptions};
pub use observer::{
    CompletionEvent, FailureReport, FailureReporter, JsonLinesBroadcaster, LoggingBroadcaster,
    LoggingFailureReporter, SnapshotBroadcaster, SubscriptionId,
};
pub use policy::{ConfigPolicyResolver, PolicyResolver, RetryPolicy, StaticPolicyResolver};
pub use state::CommandSnapshot;

/// Lock a std mutex, recovering the data if a previous holder panicked.
///
/// None of the guarded structures can be left half-updated by a panic in a
/// way that matters more than losing the whole dispatcher.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
