// src/dispatch/dispatcher.rs

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConfigFile;
use crate::dispatch::command::{
    normalize_name, CommandHandle, CommandUnit, EnqueueRequest, DEFAULT_OPERATION,
};
use crate::dispatch::completion::CompletionSignal;
use crate::dispatch::lock;
use crate::dispatch::observer::{
    CompletionEvent, CompletionSubscriber, FailureReport, FailureReporter, LoggingBroadcaster,
    LoggingFailureReporter, SnapshotBroadcaster, SubscriptionId,
};
use crate::dispatch::policy::{PolicyResolver, StaticPolicyResolver};
use crate::dispatch::queue::CommandQueue;
use crate::dispatch::state::{
    CancelRequest, CommandSnapshot, CommandState, FinishedCommand, StateStore,
};
use crate::dispatch::worker::run_worker;
use crate::errors::{DispatchError, Result};
use crate::types::{CancelCause, CommandResult, CommandStatus};

/// Upper bound on how long a failure reporter may hold up a worker.
pub const DEFAULT_FAILURE_REPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sizing and retention knobs.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Number of worker loops.
    pub parallelism: usize,
    /// How long finished commands remain visible.
    pub completed_retention: Duration,
    pub failure_report_timeout: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            parallelism: 2,
            completed_retention: Duration::from_secs(300),
            failure_report_timeout: DEFAULT_FAILURE_REPORT_TIMEOUT,
        }
    }
}

impl DispatcherOptions {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        Self {
            parallelism: cfg.dispatcher.parallelism,
            completed_retention: cfg.dispatcher.completed_retention(),
            ..Self::default()
        }
    }
}

/// Builder for [`Dispatcher`]. Collaborators default to logging
/// implementations and a never-retry policy.
pub struct DispatcherBuilder {
    options: DispatcherOptions,
    resolver: Arc<dyn PolicyResolver>,
    broadcaster: Arc<dyn SnapshotBroadcaster>,
    reporter: Arc<dyn FailureReporter>,
}

impl DispatcherBuilder {
    pub fn new(options: DispatcherOptions) -> Self {
        Self {
            options,
            resolver: Arc::new(StaticPolicyResolver::default()),
            broadcaster: Arc::new(LoggingBroadcaster),
            reporter: Arc::new(LoggingFailureReporter),
        }
    }

    pub fn policy_resolver(mut self, resolver: Arc<dyn PolicyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn broadcaster(mut self, broadcaster: Arc<dyn SnapshotBroadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn failure_reporter(mut self, reporter: Arc<dyn FailureReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn build(self) -> Dispatcher {
        let mut options = self.options;
        options.parallelism = options.parallelism.max(1);

        Dispatcher {
            inner: Arc::new(DispatcherInner {
                options,
                queue: CommandQueue::new(),
                state: StateStore::new(),
                pool_token: CancellationToken::new(),
                sequence: AtomicU64::new(0),
                run_counter: AtomicU64::new(0),
                subscription_counter: AtomicU64::new(0),
                started: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                resolver: self.resolver,
                broadcaster: self.broadcaster,
                reporter: self.reporter,
                subscribers: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }
}

/// Priority-ordered, bounded-concurrency command dispatcher.
///
/// Cheap to clone; all clones share the same queue, workers and state.
///
/// Lifecycle: `build()` → `enqueue(..)` any time → `start()` spawns the
/// workers → `stop().await` cancels everything and waits for the workers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

pub(crate) struct DispatcherInner {
    pub(crate) options: DispatcherOptions,
    pub(crate) queue: CommandQueue<CommandUnit>,
    pub(crate) state: StateStore,
    pub(crate) pool_token: CancellationToken,
    sequence: AtomicU64,
    run_counter: AtomicU64,
    subscription_counter: AtomicU64,
    started: AtomicBool,
    disposed: AtomicBool,
    pub(crate) resolver: Arc<dyn PolicyResolver>,
    broadcaster: Arc<dyn SnapshotBroadcaster>,
    reporter: Arc<dyn FailureReporter>,
    subscribers: Mutex<Vec<(SubscriptionId, CompletionSubscriber)>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("options", &self.inner.options)
            .field("queued", &self.inner.queue.len())
            .field("active", &self.inner.state.active_len())
            .field("completed", &self.inner.state.completed_len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn builder(options: DispatcherOptions) -> DispatcherBuilder {
        DispatcherBuilder::new(options)
    }

    /// Dispatcher with default collaborators.
    pub fn new(options: DispatcherOptions) -> Self {
        DispatcherBuilder::new(options).build()
    }

    pub fn options(&self) -> &DispatcherOptions {
        &self.inner.options
    }

    /// Number of items waiting for a worker.
    pub fn queued_len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Spawn the worker pool. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(DispatchError::InvalidArgument(
                "dispatcher has been stopped and cannot be restarted".to_string(),
            ));
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            warn!("dispatcher already started; ignoring start()");
            return Ok(());
        }

        let mut workers = lock(&inner.workers);
        for worker_id in 0..inner.options.parallelism {
            workers.push(tokio::spawn(run_worker(Arc::clone(inner), worker_id)));
        }
        info!(
            parallelism = inner.options.parallelism,
            queued = inner.queue.len(),
            "dispatcher started"
        );
        Ok(())
    }

    /// Cancel the pool, wait for every worker to exit and cancel whatever
    /// never got dispatched.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            debug!("dispatcher already stopped");
            return;
        }

        info!(active = inner.state.active_len(), "dispatcher stopping");
        inner.pool_token.cancel();

        let handles = std::mem::take(&mut *lock(&inner.workers));
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker loop ended abnormally");
            }
        }

        inner.cancel_leftovers();
        info!("dispatcher stopped");
    }

    /// Queue a command. Never waits for a worker.
    pub fn enqueue(&self, request: EnqueueRequest) -> Result<CommandHandle> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(DispatchError::InvalidArgument(
                "dispatcher has been stopped; no new commands are accepted".to_string(),
            ));
        }
        if request.priority == 0 {
            return Err(DispatchError::InvalidArgument(
                "priority must be >= 1 (1 is the most urgent)".to_string(),
            ));
        }

        let EnqueueRequest {
            operation,
            handler,
            run_id,
            scope,
            metadata,
            priority,
        } = request;

        let operation_name = normalize_name(Some(&operation), DEFAULT_OPERATION);
        let scope = normalize_name(scope.as_deref(), &operation_name);
        let run_id = match run_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => inner.next_run_id(&operation_name),
        };
        let sequence = inner.sequence.fetch_add(1, Ordering::SeqCst);
        let cancel = inner.pool_token.child_token();
        let completion = CompletionSignal::new();
        let metadata = Arc::new(metadata);

        let state = CommandState {
            run_id: run_id.clone(),
            operation_name: operation_name.clone(),
            scope: scope.clone(),
            priority,
            sequence,
            status: CommandStatus::Queued,
            metadata: Arc::clone(&metadata),
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            current_step: None,
            max_step: None,
            step_description: None,
            retry_count: 0,
            error_message: None,
            timeout: None,
            cancel_cause: None,
            result: None,
            cancel: cancel.clone(),
            completion: completion.clone(),
        };
        if !inner.state.insert_queued(state) {
            return Err(DispatchError::InvalidArgument(format!(
                "run id '{run_id}' is already queued or running"
            )));
        }

        let handle = CommandHandle {
            run_id: run_id.clone(),
            operation_name: operation_name.clone(),
            completion: completion.subscribe(),
        };

        inner.queue.push(
            priority,
            sequence,
            CommandUnit {
                run_id: run_id.clone(),
                operation_name: operation_name.clone(),
                scope,
                priority,
                sequence,
                metadata,
                handler,
                cancel,
            },
        );
        info!(
            run_id = %run_id,
            operation = %operation_name,
            priority,
            sequence,
            "command queued"
        );

        // Lost a race with stop(): nobody will ever dequeue this item.
        if inner.disposed.load(Ordering::SeqCst) {
            inner.cancel_leftovers();
        }

        inner.broadcast();
        Ok(handle)
    }

    /// Cancel one command. Returns `false` if it is unknown or already
    /// finished.
    pub fn cancel(&self, run_id: &str) -> bool {
        self.inner.cancel(run_id)
    }

    /// Cancel every queued and running command without stopping the pool.
    /// Returns how many commands were signalled.
    pub fn cancel_all(&self) -> usize {
        let ids = self.inner.state.active_run_ids();
        let cancelled = ids.iter().filter(|id| self.inner.cancel(id)).count();
        info!(cancelled, "cancel_all requested");
        cancelled
    }

    /// Active and recently finished commands, oldest first.
    pub fn active_commands(&self) -> Vec<CommandSnapshot> {
        self.inner.state.snapshots()
    }

    pub fn command(&self, run_id: &str) -> Option<CommandSnapshot> {
        self.inner.state.get(run_id)
    }

    /// Wait for a command's final result.
    ///
    /// Unknown (or already evicted) run ids yield a "not found" result.
    /// Returns `DispatchError::WaitCancelled` if `cancel` trips first; the
    /// command itself is left alone.
    pub async fn wait_for_completion(
        &self,
        run_id: &str,
        cancel: CancellationToken,
    ) -> Result<CommandResult> {
        let Some(signal) = self.inner.state.completion(run_id) else {
            return Ok(CommandResult::not_found(run_id));
        };

        tokio::select! {
            biased;
            result = signal.subscribe().wait() => Ok(result),
            _ = cancel.cancelled() => Err(DispatchError::WaitCancelled(run_id.to_string())),
        }
    }

    pub fn report_progress(
        &self,
        run_id: &str,
        current_step: u32,
        max_step: Option<u32>,
        description: Option<&str>,
    ) -> bool {
        self.inner
            .report_progress(run_id, current_step, max_step, description)
    }

    pub fn set_retry_count(&self, run_id: &str, retry_count: u32) -> bool {
        let updated = self
            .inner
            .state
            .update_active(run_id, |s| s.retry_count = retry_count);
        if updated {
            self.inner.broadcast();
        }
        updated
    }

    pub fn set_operation_name(&self, run_id: &str, name: &str) -> bool {
        self.inner.set_operation_name(run_id, name)
    }

    /// Register a completion callback. Each callback runs in isolation:
    /// an error or panic in one is logged and does not affect the others.
    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&CompletionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(
            self.inner
                .subscription_counter
                .fetch_add(1, Ordering::SeqCst),
        );
        let subscriber: CompletionSubscriber = Arc::new(subscriber);
        lock(&self.inner.subscribers).push((id, subscriber));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.inner.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }
}

impl DispatcherInner {
    fn next_run_id(&self, operation_name: &str) -> String {
        let counter = self.run_counter.fetch_add(1, Ordering::SeqCst);
        let slug: String = operation_name
            .chars()
            .map(|c| if c.is_whitespace() { '-' } else { c })
            .collect();
        format!("{slug}-{}-{counter}", Utc::now().timestamp_millis())
    }

    fn cancel(self: &Arc<Self>, run_id: &str) -> bool {
        match self.state.request_cancel(run_id) {
            CancelRequest::NotFound => {
                debug!(run_id = %run_id, "cancel: command not found or already finished");
                false
            }
            CancelRequest::CancelledWhileQueued(finished) => {
                info!(
                    run_id = %run_id,
                    cause = %CancelCause::Manual,
                    "command cancelled before it started"
                );
                self.after_finish(finished);
                true
            }
            CancelRequest::SignalledRunning => {
                info!(run_id = %run_id, "cancellation requested for running command");
                true
            }
        }
    }

    /// Finalize everything still sitting in the queue after shutdown.
    fn cancel_leftovers(self: &Arc<Self>) {
        for entry in self.queue.close() {
            let run_id = entry.payload.run_id;
            if let Some(finished) = self.state.finish(
                &run_id,
                CommandStatus::Cancelled,
                CommandResult::cancelled(),
                Some(CancelCause::Shutdown),
            ) {
                info!(run_id = %run_id, cause = %CancelCause::Shutdown, "queued command cancelled");
                self.after_finish(finished);
            }
        }
    }

    pub(crate) fn report_progress(
        &self,
        run_id: &str,
        current_step: u32,
        max_step: Option<u32>,
        description: Option<&str>,
    ) -> bool {
        let updated = self.state.update_active(run_id, |s| {
            s.current_step = Some(current_step);
            if max_step.is_some() {
                s.max_step = max_step;
            }
            if let Some(desc) = description {
                s.step_description = Some(desc.to_string());
            }
        });
        if updated {
            debug!(run_id = %run_id, current_step, ?max_step, "progress reported");
            self.broadcast();
        }
        updated
    }

    pub(crate) fn set_operation_name(&self, run_id: &str, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        let updated = self
            .state
            .update_active(run_id, |s| s.operation_name = name.to_string());
        if updated {
            self.broadcast();
        }
        updated
    }

    pub(crate) fn record_retry(&self, run_id: &str, retry_count: u32, last_error: &str) {
        if self.state.update_active(run_id, |s| {
            s.retry_count = retry_count;
            s.error_message = Some(last_error.to_string());
        }) {
            self.broadcast();
        }
    }

    /// Move a command to its terminal state and fire every completion side
    /// effect. Returns `false` if someone else already finished it.
    pub(crate) fn complete(
        self: &Arc<Self>,
        run_id: &str,
        status: CommandStatus,
        result: CommandResult,
        cause: Option<CancelCause>,
    ) -> bool {
        match self.state.finish(run_id, status, result, cause) {
            Some(finished) => {
                self.after_finish(finished);
                true
            }
            None => false,
        }
    }

    fn after_finish(self: &Arc<Self>, finished: FinishedCommand) {
        if !finished.completion.resolve(finished.result.clone()) {
            warn!(run_id = %finished.run_id, "completion signal was already resolved");
        }

        let event = CompletionEvent {
            run_id: finished.run_id.clone(),
            operation_name: finished.operation_name.clone(),
            success: finished.result.success,
            message: finished.result.message.clone(),
            metadata: finished.metadata.clone(),
        };
        self.notify_subscribers(&event);
        self.schedule_eviction(finished.run_id, finished.sequence);
        self.broadcast();
    }

    fn notify_subscribers(&self, event: &CompletionEvent) {
        let subscribers: Vec<CompletionSubscriber> = lock(&self.subscribers)
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();

        for subscriber in subscribers {
            match std::panic::catch_unwind(AssertUnwindSafe(|| subscriber(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    run_id = %event.run_id,
                    error = %e,
                    "completion subscriber failed"
                ),
                Err(_) => warn!(run_id = %event.run_id, "completion subscriber panicked"),
            }
        }
    }

    fn schedule_eviction(self: &Arc<Self>, run_id: String, sequence: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(run_id = %run_id, "no runtime available; finished command will not be evicted");
            return;
        };
        let retention = self.options.completed_retention;
        let weak = Arc::downgrade(self);

        runtime.spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(inner) = weak.upgrade() {
                if inner.state.evict(&run_id, sequence) {
                    inner.broadcast();
                }
            }
        });
    }

    /// Publish the current snapshot list without waiting for the broadcaster.
    pub(crate) fn broadcast(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime available; skipping snapshot broadcast");
            return;
        };
        let snapshots = self.state.snapshots();
        let broadcaster = Arc::clone(&self.broadcaster);

        runtime.spawn(async move {
            if let Err(e) = broadcaster.publish(snapshots).await {
                warn!(error = %e, "snapshot broadcast failed");
            }
        });
    }

    /// Hand a report to the failure reporter. Errors, panics and slow
    /// reporters are logged and otherwise ignored.
    pub(crate) async fn report_failure(&self, report: FailureReport) {
        let run_id = report.run_id.clone();
        let reporter = Arc::clone(&self.reporter);
        let task = tokio::spawn(async move { reporter.report(report).await });

        match tokio::time::timeout(self.options.failure_report_timeout, task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                warn!(run_id = %run_id, error = %e, "failure reporter returned an error")
            }
            Ok(Err(e)) => warn!(run_id = %run_id, error = %e, "failure reporter task aborted"),
            Err(_) => warn!(run_id = %run_id, "failure reporter timed out"),
        }
    }

    /// Finish a command whose pipeline task died without reaching a terminal
    /// state.
    pub(crate) async fn abandon(self: &Arc<Self>, run_id: &str, reason: String) {
        let Some(snapshot) = self.state.get(run_id) else {
            return;
        };
        if snapshot.status.is_terminal() {
            return;
        }
        if snapshot.status == CommandStatus::Queued {
            self.state.mark_running(run_id, None);
        }

        let started = snapshot.started_at.unwrap_or(snapshot.enqueued_at);
        let execution_time = (Utc::now() - started).to_std().unwrap_or_default();
        self.report_failure(FailureReport {
            run_id: run_id.to_string(),
            operation_name: snapshot.operation_name.clone(),
            scope: snapshot.scope.clone(),
            message: reason.clone(),
            error: Some(reason.clone()),
            retry_count: snapshot.retry_count,
            execution_time,
            metadata: snapshot.metadata.clone(),
        })
        .await;

        self.complete(
            run_id,
            CommandStatus::Failed,
            CommandResult::failure(reason),
            None,
        );
    }
}
