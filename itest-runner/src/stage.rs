//! Sequential stage execution with soft and hard deadlines.
//!
//! Each [`Stage`] runs on its own tokio task. The callback receives a
//! [`Context`] that expires at the stage's soft deadline (`ctx_timeout`);
//! the runner itself waits only until the hard deadline (`run_timeout`).
//! A stage that is still running at that point is abandoned: its task is
//! detached, not aborted, and every later stage is skipped.
//!
//! A `fatal` report unwinds only the task it was raised on. Any other panic
//! is handed to the stage's [`PanicHandler`] and the run carries on.

use futures::FutureExt;
use futures::future::BoxFuture;
use itest_common::Context;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

type StageFn = Box<dyn FnOnce(Context) -> BoxFuture<'static, ()> + Send>;

/// Receives `(stage name, panic message)` for panics other than `fatal`.
pub type PanicHandler = Arc<dyn Fn(&str, String) + Send + Sync>;

/// One timed callback in a stage sequence.
pub struct Stage {
    name: String,
    func: StageFn,
    ctx_timeout: Duration,
    run_timeout: Duration,
}

impl Stage {
    /// `ctx_timeout` bounds the context handed to `f`; `run_timeout` is how
    /// long the runner waits for `f` before giving up on it.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        ctx_timeout: Duration,
        run_timeout: Duration,
        f: F,
    ) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(move |ctx| Box::pin(f(ctx))),
            ctx_timeout,
            run_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ctx_timeout(&self) -> Duration {
        self.ctx_timeout
    }

    pub fn run_timeout(&self) -> Duration {
        self.run_timeout
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("ctx_timeout", &self.ctx_timeout)
            .field("run_timeout", &self.run_timeout)
            .finish_non_exhaustive()
    }
}

/// Unwind payload raised by `fatal`. Never reported as a panic.
pub(crate) struct FatalUnwind;

/// Stop the current task after a fatal report.
pub(crate) fn abort_task() -> ! {
    // resume_unwind skips the panic hook, so nothing is printed to stderr.
    std::panic::resume_unwind(Box::new(FatalUnwind))
}

/// Text of a caught panic, or `None` for a fatal unwind.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> Option<String> {
    if payload.is::<FatalUnwind>() {
        None
    } else if let Some(msg) = payload.downcast_ref::<&'static str>() {
        Some((*msg).to_string())
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        Some(msg.clone())
    } else {
        Some("unknown panic payload".to_string())
    }
}

/// Run stages in order. Returns `false` as soon as one misses its hard
/// deadline; the remaining stages never start.
pub async fn run_stages(ctx: &Context, stages: Vec<Stage>, on_panic: PanicHandler) -> bool {
    let total = stages.len();
    for (index, stage) in stages.into_iter().enumerate() {
        if !run_stage(ctx, stage, on_panic.clone()).await {
            debug!(skipped = total - index - 1, "Stopping stage sequence");
            return false;
        }
    }
    true
}

/// Run a single stage. Returns `false` if it had to be abandoned.
///
/// The stage's context is cancelled before this returns, whether the
/// callback finished or not.
pub async fn run_stage(ctx: &Context, stage: Stage, on_panic: PanicHandler) -> bool {
    let Stage {
        name,
        func,
        ctx_timeout,
        run_timeout,
    } = stage;

    let started = Instant::now();
    let hard_deadline = started + run_timeout;
    let (stage_ctx, cancel) = ctx.with_timeout(ctx_timeout);
    debug!(stage = %name, ?ctx_timeout, ?run_timeout, "Starting stage");

    let task_name = name.clone();
    let handle = tokio::spawn(async move {
        let outcome = AssertUnwindSafe(async move { func(stage_ctx).await })
            .catch_unwind()
            .await;
        if let Err(payload) = outcome
            && let Some(message) = panic_message(payload.as_ref())
        {
            on_panic(&task_name, message);
        }
    });

    let completed = match tokio::time::timeout_at(hard_deadline, handle).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            // Only reachable when the runtime is shutting down.
            warn!(stage = %name, error = %err, "Stage task did not finish cleanly");
            true
        }
        Err(_) => {
            warn!(
                stage = %name,
                ?run_timeout,
                "Stage missed its hard deadline, abandoning it"
            );
            false
        }
    };
    cancel.cancel();

    debug!(
        stage = %name,
        elapsed_ms = started.elapsed().as_millis() as u64,
        completed,
        "Finished stage"
    );
    completed
}
