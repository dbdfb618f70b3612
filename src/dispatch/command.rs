// src/dispatch/command.rs

//! Command units, handlers and the per-attempt execution context.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use tokio_util::sync::CancellationToken;

use crate::dispatch::completion::CompletionFuture;
use crate::dispatch::dispatcher::DispatcherInner;
use crate::errors::HandlerError;
use crate::types::CommandResult;

/// Operation name used when the caller passes a blank one.
pub const DEFAULT_OPERATION: &str = "command";

/// Priority used when the caller does not pick one ("normal").
pub const DEFAULT_PRIORITY: u8 = 2;

pub type HandlerResult = Result<CommandResult, HandlerError>;

pub type BoxHandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'static>>;

/// Asynchronous command body. Invoked once per attempt.
pub type Handler = Arc<dyn Fn(ExecutionContext) -> BoxHandlerFuture + Send + Sync>;

/// Box an async closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Caller-side description of a command to enqueue.
pub struct EnqueueRequest {
    pub(crate) operation: String,
    pub(crate) handler: Handler,
    pub(crate) run_id: Option<String>,
    pub(crate) scope: Option<String>,
    pub(crate) metadata: BTreeMap<String, String>,
    pub(crate) priority: u8,
}

impl fmt::Debug for EnqueueRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnqueueRequest")
            .field("operation", &self.operation)
            .field("run_id", &self.run_id)
            .field("scope", &self.scope)
            .field("metadata", &self.metadata)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl EnqueueRequest {
    pub fn new(operation: impl Into<String>, handler: Handler) -> Self {
        Self {
            operation: operation.into(),
            handler,
            run_id: None,
            scope: None,
            metadata: BTreeMap::new(),
            priority: DEFAULT_PRIORITY,
        }
    }

    /// Shorthand for `EnqueueRequest::new(operation, handler_fn(f))`.
    pub fn from_fn<F, Fut>(operation: impl Into<String>, f: F) -> Self
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::new(operation, handler_fn(f))
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Trim `value`, falling back to `fallback` when nothing is left.
pub(crate) fn normalize_name(value: Option<&str>, fallback: &str) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => fallback.to_string(),
    }
}

/// A command as it sits in the queue. Immutable once enqueued.
#[derive(Clone)]
pub struct CommandUnit {
    pub run_id: String,
    pub operation_name: String,
    pub scope: String,
    pub priority: u8,
    pub sequence: u64,
    pub metadata: Arc<BTreeMap<String, String>>,
    pub(crate) handler: Handler,
    pub(crate) cancel: CancellationToken,
}

impl fmt::Debug for CommandUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandUnit")
            .field("run_id", &self.run_id)
            .field("operation_name", &self.operation_name)
            .field("scope", &self.scope)
            .field("priority", &self.priority)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Returned by `enqueue`.
#[derive(Debug)]
pub struct CommandHandle {
    pub run_id: String,
    pub operation_name: String,
    pub completion: CompletionFuture,
}

impl CommandHandle {
    /// Wait for the command's final result.
    pub async fn wait(self) -> CommandResult {
        self.completion.wait().await
    }
}

/// What a handler sees while it runs one attempt.
#[derive(Clone)]
pub struct ExecutionContext {
    run_id: String,
    operation_name: String,
    scope: String,
    attempt: u32,
    max_attempts: u32,
    metadata: Arc<BTreeMap<String, String>>,
    cancel: CancellationToken,
    dispatcher: Weak<DispatcherInner>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("operation_name", &self.operation_name)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    pub(crate) fn new(
        unit: &CommandUnit,
        attempt: u32,
        max_attempts: u32,
        cancel: CancellationToken,
        dispatcher: Weak<DispatcherInner>,
    ) -> Self {
        Self {
            run_id: unit.run_id.clone(),
            operation_name: unit.operation_name.clone(),
            scope: unit.scope.clone(),
            attempt,
            max_attempts,
            metadata: unit.metadata.clone(),
            cancel,
            dispatcher,
        }
    }

    /// Context that is not attached to any dispatcher. Progress calls are
    /// no-ops. Useful for exercising handlers directly.
    pub fn detached(run_id: impl Into<String>, operation_name: impl Into<String>) -> Self {
        let operation_name = operation_name.into();
        Self {
            run_id: run_id.into(),
            scope: operation_name.clone(),
            operation_name,
            attempt: 1,
            max_attempts: 1,
            metadata: Arc::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
            dispatcher: Weak::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Token tripped by per-command cancel, pool shutdown or attempt timeout.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// `Err(HandlerError::Cancelled)` once the token has tripped; handy as a
    /// `?` checkpoint inside long handlers.
    pub fn checkpoint(&self) -> Result<(), HandlerError> {
        if self.cancel.is_cancelled() {
            Err(HandlerError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn report_progress(
        &self,
        current_step: u32,
        max_step: Option<u32>,
        description: Option<&str>,
    ) {
        if let Some(inner) = self.dispatcher.upgrade() {
            inner.report_progress(&self.run_id, current_step, max_step, description);
        }
    }

    pub fn set_operation_name(&self, name: &str) {
        if let Some(inner) = self.dispatcher.upgrade() {
            inner.set_operation_name(&self.run_id, name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_names_fall_back() {
        assert_eq!(normalize_name(Some("   "), DEFAULT_OPERATION), "command");
        assert_eq!(normalize_name(None, "build"), "build");
        assert_eq!(normalize_name(Some("  mix audio "), "x"), "mix audio");
    }

    #[test]
    fn request_builder_collects_fields() {
        let req = EnqueueRequest::from_fn("summarize", |_ctx| async {
            Ok(CommandResult::success("done"))
        })
        .run_id("run-1")
        .scope("story-7")
        .meta("story_id", "7")
        .priority(1);

        assert_eq!(req.operation, "summarize");
        assert_eq!(req.run_id.as_deref(), Some("run-1"));
        assert_eq!(req.scope.as_deref(), Some("story-7"));
        assert_eq!(req.metadata.get("story_id").map(String::as_str), Some("7"));
        assert_eq!(req.priority, 1);
    }

    #[tokio::test]
    async fn detached_context_checkpoint_follows_token() {
        let ctx = ExecutionContext::detached("r", "op");
        assert!(ctx.checkpoint().is_ok());
        ctx.report_progress(1, Some(2), Some("no dispatcher attached"));

        ctx.cancellation_token().cancel();
        assert!(matches!(ctx.checkpoint(), Err(HandlerError::Cancelled)));
        ctx.cancelled().await;
    }
}
