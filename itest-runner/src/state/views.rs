//! Phase-specific views over an [`EntityRoot`](super::EntityRoot).

use super::scope::{DataAccess, EntityMeta, EntityScoped, Logger, OutDirAccess, Reporter, Scope};
use crate::dut::RemoteDevice;
use crate::fixture::FixtValue;
use crate::precondition::PreValue;
use crate::stage::panic_message;
use futures::FutureExt;
use itest_common::Context;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::warn;

macro_rules! view_traits {
    ($view:ty: $($capability:ident),+) => {
        impl EntityScoped for $view {
            fn scope(&self) -> &Scope {
                &self.scope
            }
        }
        $(impl $capability for $view {})+
    };
}

fn downcast<T: Any + Send + Sync>(value: Option<Arc<dyn Any + Send + Sync>>) -> Option<Arc<T>> {
    value.and_then(|v| v.downcast::<T>().ok())
}

/// Passed to a test body and its subtests.
#[derive(Debug, Clone)]
pub struct State {
    scope: Scope,
}

view_traits!(State: Logger, Reporter, DataAccess, OutDirAccess, EntityMeta);

impl State {
    pub(crate) fn new(scope: Scope) -> Self {
        Self { scope }
    }

    /// Run `f` as a subtest named `name` on its own task and wait for it.
    ///
    /// Errors reported by the subtest are prefixed with its path and also
    /// mark this test as failed. A `fatal` inside the subtest ends only the
    /// subtest. Returns `true` if the subtest reported no errors.
    pub async fn run<F, Fut>(&self, ctx: &Context, name: &str, f: F) -> bool
    where
        F: FnOnce(Context, State) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let scope = self.scope.subtest(name);
        let sub = State::new(scope.clone());
        let panic_scope = scope.clone();
        let ctx = ctx.clone();

        scope.log(&format!("Starting subtest {}", scope.subtest_path()));
        let handle = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(async move { f(ctx, sub).await })
                .catch_unwind()
                .await;
            if let Err(payload) = outcome
                && let Some(message) = panic_message(payload.as_ref())
            {
                panic_scope.report_panic(message);
            }
        });
        if let Err(err) = handle.await {
            warn!(subtest = %scope.subtest_path(), error = %err, "Subtest task did not finish cleanly");
        }

        !scope.has_error()
    }

    /// Path of this subtest (`a/b`), empty for the top-level test.
    pub fn subtest_path(&self) -> &str {
        self.scope.subtest_path()
    }

    /// Value produced by the test's precondition.
    pub fn pre_value<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        downcast(self.pre_value_any())
    }

    pub fn pre_value_any(&self) -> Option<PreValue> {
        self.scope.root().config().precondition.value()
    }

    /// Context shared by every test using the same precondition.
    pub fn pre_ctx(&self) -> Option<Context> {
        self.scope.root().config().precondition.context()
    }

    /// Value provided by the innermost fixture.
    pub fn fixt_value<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        downcast(self.fixt_value_any())
    }

    pub fn fixt_value_any(&self) -> Option<FixtValue> {
        self.scope.root().config().fixt_value.clone()
    }

    pub fn dut(&self) -> Option<Arc<dyn RemoteDevice>> {
        self.scope.root().dut().cloned()
    }
}

/// Passed to a precondition's prepare and close.
#[derive(Debug, Clone)]
pub struct PreState {
    scope: Scope,
}

view_traits!(PreState: Logger, Reporter, DataAccess, OutDirAccess, EntityMeta);

impl PreState {
    pub(crate) fn new(scope: Scope) -> Self {
        Self { scope }
    }

    /// Context that lives as long as the precondition stays prepared.
    pub fn pre_ctx(&self) -> Option<Context> {
        self.scope.root().config().precondition.context()
    }

    pub fn dut(&self) -> Option<Arc<dyn RemoteDevice>> {
        self.scope.root().dut().cloned()
    }
}

/// Passed to the runner's pre-test and post-test hooks.
#[derive(Debug, Clone)]
pub struct TestHookState {
    scope: Scope,
}

view_traits!(TestHookState: Logger, Reporter, OutDirAccess, EntityMeta);

impl TestHookState {
    pub(crate) fn new(scope: Scope) -> Self {
        Self { scope }
    }

    pub fn dut(&self) -> Option<Arc<dyn RemoteDevice>> {
        self.scope.root().dut().cloned()
    }
}

/// Passed to a fixture's set up and tear down.
#[derive(Debug, Clone)]
pub struct FixtState {
    scope: Scope,
}

view_traits!(FixtState: Logger, Reporter, DataAccess, OutDirAccess, EntityMeta);

impl FixtState {
    pub(crate) fn new(scope: Scope) -> Self {
        Self { scope }
    }

    /// Context that lives from set up until tear down.
    pub fn fixt_ctx(&self) -> Option<Context> {
        self.scope.root().fixture_env().map(|env| env.ctx.clone())
    }

    /// Value of the fixture this one was pushed on top of.
    pub fn parent_value<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        downcast(
            self.scope
                .root()
                .fixture_env()
                .and_then(|env| env.parent_value.clone()),
        )
    }
}

/// Passed to a fixture's per-test hooks. Reports go to the test.
#[derive(Debug, Clone)]
pub struct FixtTestState {
    scope: Scope,
    fixture: String,
}

view_traits!(FixtTestState: Logger, Reporter, OutDirAccess);

impl FixtTestState {
    pub(crate) fn new(scope: Scope, fixture: String) -> Self {
        Self { scope, fixture }
    }

    pub fn test_name(&self) -> &str {
        &self.scope.root().info().name
    }

    pub fn fixture_name(&self) -> &str {
        &self.fixture
    }
}
