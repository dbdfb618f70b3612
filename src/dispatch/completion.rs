// src/dispatch/completion.rs

//! One-shot, multi-reader completion signal.
//!
//! Each command owns one [`CompletionSignal`]. It is resolved exactly once
//! with the command's final [`CommandResult`]; any number of
//! [`CompletionFuture`]s can await it, before or after resolution.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;

use crate::types::CommandResult;

#[derive(Clone)]
pub struct CompletionSignal {
    tx: Arc<watch::Sender<Option<CommandResult>>>,
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Store the final result.
    ///
    /// Returns `false` (and leaves the stored result untouched) if the signal
    /// was already resolved.
    pub fn resolve(&self, result: CommandResult) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The result, if already resolved.
    pub fn result(&self) -> Option<CommandResult> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> CompletionFuture {
        CompletionFuture {
            rx: self.tx.subscribe(),
        }
    }
}

/// Awaitable view of a [`CompletionSignal`].
///
/// Either call [`CompletionFuture::wait`] or `.await` it directly.
#[derive(Debug)]
pub struct CompletionFuture {
    rx: watch::Receiver<Option<CommandResult>>,
}

impl CompletionFuture {
    pub async fn wait(mut self) -> CommandResult {
        match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot)
                .clone()
                .unwrap_or_else(|| CommandResult::failure("completion signal empty")),
            Err(_) => {
                CommandResult::failure("completion signal dropped before the command finished")
            }
        }
    }

    /// Non-blocking peek at the result.
    pub fn try_result(&self) -> Option<CommandResult> {
        self.rx.borrow().clone()
    }
}

impl IntoFuture for CompletionFuture {
    type Output = CommandResult;
    type IntoFuture = Pin<Box<dyn Future<Output = CommandResult> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}
