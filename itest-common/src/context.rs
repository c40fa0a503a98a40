//! Cancellable execution context.
//!
//! A [`Context`] is what user callbacks observe as "my time is up": it fires
//! when its [`CancelHandle`] (or any ancestor's) is cancelled, or when its
//! deadline passes. Contexts are cheap to clone and form a tree; cancelling a
//! parent cancels every child, never the other way round.

use crate::errors::ContextError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Receives log lines emitted through [`Context::log`].
pub trait ContextLogger: Send + Sync {
    fn log(&self, msg: &str);
}

/// Cancellation signal plus optional deadline, passed to every stage callback.
#[derive(Clone)]
pub struct Context {
    id: u64,
    token: CancellationToken,
    deadline: Option<Instant>,
    logger: Option<Arc<dyn ContextLogger>>,
}

/// Cancels the [`Context`] it was created with (and all of its children).
#[derive(Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Cancel the associated context. Calling this more than once is a no-op.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the associated context has been cancelled explicitly.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl Context {
    /// A root context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            id: next_id(),
            token: CancellationToken::new(),
            deadline: None,
            logger: None,
        }
    }

    /// Derive a child that can be cancelled independently of its parent.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        self.derive(self.deadline)
    }

    /// Derive a child whose deadline is `timeout` from now (or the parent's
    /// deadline, whichever is earlier).
    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelHandle) {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child with the given deadline, clamped to the parent's.
    pub fn with_deadline(&self, deadline: Instant) -> (Context, CancelHandle) {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        self.derive(Some(deadline))
    }

    fn derive(&self, deadline: Option<Instant>) -> (Context, CancelHandle) {
        let token = self.token.child_token();
        let child = Context {
            id: next_id(),
            token: token.clone(),
            deadline,
            logger: self.logger.clone(),
        };
        (child, CancelHandle { token })
    }

    /// Return a copy of this context that routes [`Context::log`] to `logger`.
    ///
    /// The copy shares cancellation and deadline with `self`.
    pub fn with_logger(&self, logger: Arc<dyn ContextLogger>) -> Context {
        Context {
            id: self.id,
            token: self.token.clone(),
            deadline: self.deadline,
            logger: Some(logger),
        }
    }

    /// Identifier shared by every clone of this context.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether `other` is a clone of this very context.
    pub fn same_as(&self, other: &Context) -> bool {
        self.id == other.id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, if one is set. Saturates at zero.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the context has been cancelled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Why the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<ContextError> {
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Some(ContextError::DeadlineExceeded);
        }
        if self.token.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        None
    }

    /// Resolve once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Drive `fut` until it completes or the context finishes, whichever
    /// comes first.
    pub async fn run_until_done<F>(&self, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.done() => Err(self.err().unwrap_or(ContextError::Canceled)),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `duration`, returning early with an error if the context
    /// finishes first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        self.run_until_done(tokio::time::sleep(duration)).await
    }

    /// Log through the attached logger. Returns `false` when no logger is
    /// attached.
    pub fn log(&self, msg: impl fmt::Display) -> bool {
        match &self.logger {
            Some(logger) => {
                logger.log(&msg.to_string());
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .field("done", &self.is_done())
            .field("has_logger", &self.logger.is_some())
            .finish()
    }
}

fn next_id() -> u64 {
    NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)
}
