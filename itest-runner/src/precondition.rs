//! Preconditions shared by consecutive tests.
//!
//! Tests that declare the same precondition (the same `Arc`, compared by
//! address) and run back to back share one prepared value and one context.
//! The [`PreconditionCarry`] is what carries that state from one test to the
//! next; the runner prepares it on first use and closes it after the last
//! test in the run of sharers.

use crate::state::PreState;
use async_trait::async_trait;
use itest_common::{CancelHandle, Context};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Opaque value produced by [`Precondition::prepare`].
pub type PreValue = Arc<dyn Any + Send + Sync>;

#[async_trait]
pub trait Precondition: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Soft timeout for each of prepare and close.
    fn timeout(&self) -> Duration;

    async fn prepare(&self, ctx: &Context, s: &PreState) -> anyhow::Result<PreValue>;

    async fn close(&self, ctx: &Context, s: &PreState) -> anyhow::Result<()>;
}

/// Whether `a` and `b` are the very same precondition object.
pub fn same_precondition(a: &Arc<dyn Precondition>, b: &Arc<dyn Precondition>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

struct SharedPrecondition {
    owner: Arc<dyn Precondition>,
    ctx: Context,
    cancel: CancelHandle,
    value: Option<PreValue>,
}

impl SharedPrecondition {
    fn is_binding(&self, pre: &Arc<dyn Precondition>, token: &Context) -> bool {
        same_precondition(&self.owner, pre) && self.ctx.same_as(token)
    }
}

/// Precondition state handed from one test invocation to the next.
///
/// Clones share the same slot.
#[derive(Clone, Default)]
pub struct PreconditionCarry {
    inner: Arc<Mutex<Option<SharedPrecondition>>>,
}

impl PreconditionCarry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<SharedPrecondition>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind the carry to `pre` and return its shared context and any value
    /// already prepared for it.
    ///
    /// A carry still bound to a different precondition is cancelled and
    /// replaced. The returned context also identifies this binding: pass it
    /// back to [`set_value`](Self::set_value) and
    /// [`release_if`](Self::release_if), which do nothing once the binding
    /// has been replaced.
    pub(crate) fn acquire(&self, pre: &Arc<dyn Precondition>) -> (Context, Option<PreValue>) {
        let mut slot = self.lock();
        if let Some(shared) = slot.as_ref()
            && same_precondition(&shared.owner, pre)
        {
            return (shared.ctx.clone(), shared.value.clone());
        }
        if let Some(stale) = slot.take() {
            debug!(
                stale = stale.owner.name(),
                next = pre.name(),
                "Replacing precondition that was never closed"
            );
            stale.cancel.cancel();
        }

        let (ctx, cancel) = Context::background().with_cancel();
        *slot = Some(SharedPrecondition {
            owner: pre.clone(),
            ctx: ctx.clone(),
            cancel,
            value: None,
        });
        (ctx, None)
    }

    /// Store the prepared value, unless the binding `token` came from is
    /// gone. Returns whether the value was stored.
    pub(crate) fn set_value(
        &self,
        pre: &Arc<dyn Precondition>,
        token: &Context,
        value: PreValue,
    ) -> bool {
        let mut slot = self.lock();
        match slot.as_mut() {
            Some(shared) if shared.is_binding(pre, token) => {
                shared.value = Some(value);
                true
            }
            _ => {
                debug!(precondition = pre.name(), "Discarding value for a replaced precondition");
                false
            }
        }
    }

    /// Shared context of `pre`, if the carry is currently bound to it.
    pub(crate) fn context_for(&self, pre: &Arc<dyn Precondition>) -> Option<Context> {
        self.lock()
            .as_ref()
            .filter(|shared| same_precondition(&shared.owner, pre))
            .map(|shared| shared.ctx.clone())
    }

    /// Like [`release`](Self::release), but only while the carry still holds
    /// the binding `token` came from. A close that finishes after its test was
    /// abandoned must not cancel whatever a later test bound since.
    pub fn release_if(&self, pre: &Arc<dyn Precondition>, token: &Context) -> bool {
        let mut slot = self.lock();
        if !slot.as_ref().is_some_and(|shared| shared.is_binding(pre, token)) {
            return false;
        }
        match slot.take() {
            Some(shared) => {
                debug!(precondition = shared.owner.name(), "Releasing precondition");
                shared.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the shared context and forget the precondition. Returns
    /// `false` if nothing was held.
    pub fn release(&self) -> bool {
        match self.lock().take() {
            Some(shared) => {
                debug!(precondition = shared.owner.name(), "Releasing precondition");
                shared.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn context(&self) -> Option<Context> {
        self.lock().as_ref().map(|shared| shared.ctx.clone())
    }

    pub fn value(&self) -> Option<PreValue> {
        self.lock().as_ref().and_then(|shared| shared.value.clone())
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    /// Whether the carry currently holds `pre`.
    pub fn holds(&self, pre: &Arc<dyn Precondition>) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|shared| same_precondition(&shared.owner, pre))
    }
}

impl fmt::Debug for PreconditionCarry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.lock();
        f.debug_struct("PreconditionCarry")
            .field("precondition", &slot.as_ref().map(|s| s.owner.name().to_string()))
            .field("prepared", &slot.as_ref().is_some_and(|s| s.value.is_some()))
            .finish()
    }
}
