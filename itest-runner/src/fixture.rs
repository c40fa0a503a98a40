//! Fixtures: long-lived environments that several tests run inside.
//!
//! A [`FixtureStack`] holds the fixtures currently set up, innermost last.
//! Pushing runs a fixture's set up, popping runs its tear down, and every
//! test that runs on the stack gets each fixture's pre-test and post-test
//! hooks as extra stages around its body.

use crate::instance::RuntimeConfig;
use crate::precondition::PreconditionCarry;
use crate::stage::{Stage, run_stage};
use crate::state::{
    EntityInfo, EntityKind, EntityRoot, FixtState, FixtTestState, FixtureEnv, Reporter,
};
use async_trait::async_trait;
use itest_common::{CancelHandle, Context, OutputSink};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Value a fixture provides to the tests (and fixtures) running on it.
pub type FixtValue = Arc<dyn Any + Send + Sync>;

/// Default soft timeout of each fixture operation.
pub const DEFAULT_FIXTURE_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait Fixture: Send + Sync + 'static {
    async fn set_up(&self, ctx: &Context, s: &FixtState) -> anyhow::Result<FixtValue>;

    /// Bring the fixture back to a clean state between tests.
    async fn reset(&self, _ctx: &Context) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pre_test(&self, _ctx: &Context, _s: &FixtTestState) {}

    async fn post_test(&self, _ctx: &Context, _s: &FixtTestState) {}

    async fn tear_down(&self, ctx: &Context, s: &FixtState);
}

/// A registered fixture and its timeouts.
#[derive(Clone)]
pub struct FixtureInstance {
    pub name: String,
    pub fixture: Arc<dyn Fixture>,
    pub data: Vec<String>,
    pub vars: Vec<String>,
    pub set_up_timeout: Duration,
    pub reset_timeout: Duration,
    pub pre_test_timeout: Duration,
    pub post_test_timeout: Duration,
    pub tear_down_timeout: Duration,
}

impl FixtureInstance {
    pub fn new(name: impl Into<String>, fixture: Arc<dyn Fixture>) -> Self {
        Self {
            name: name.into(),
            fixture,
            data: Vec::new(),
            vars: Vec::new(),
            set_up_timeout: DEFAULT_FIXTURE_TIMEOUT,
            reset_timeout: DEFAULT_FIXTURE_TIMEOUT,
            pre_test_timeout: DEFAULT_FIXTURE_TIMEOUT,
            post_test_timeout: DEFAULT_FIXTURE_TIMEOUT,
            tear_down_timeout: DEFAULT_FIXTURE_TIMEOUT,
        }
    }

    fn entity_info(&self) -> EntityInfo {
        EntityInfo {
            data: self.data.clone(),
            vars: self.vars.clone(),
            ..EntityInfo::new(self.name.clone(), EntityKind::Fixture)
        }
    }
}

impl fmt::Debug for FixtureInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureInstance")
            .field("name", &self.name)
            .field("set_up_timeout", &self.set_up_timeout)
            .field("tear_down_timeout", &self.tear_down_timeout)
            .finish_non_exhaustive()
    }
}

/// Health of a fixture stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureStatus {
    /// Every fixture is set up and was reset successfully.
    Green,
    /// A reset failed; the fixtures must be torn down and set up again.
    Yellow,
    /// A set up failed; tests cannot run on this stack.
    Red,
}

impl fmt::Display for FixtureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Green => write!(f, "green"),
            Self::Yellow => write!(f, "yellow"),
            Self::Red => write!(f, "red"),
        }
    }
}

struct StackEntry {
    fixt: Arc<FixtureInstance>,
    root: Arc<EntityRoot>,
    cancel: CancelHandle,
    value: FixtValue,
}

/// Stages a fixture stack contributes to one test.
pub struct TestStages {
    /// Pre-test hooks, outermost fixture first.
    pub pre: Vec<Stage>,
    /// Post-test hooks, innermost fixture first.
    pub post: Vec<Stage>,
}

/// Fixtures currently set up, innermost last.
pub struct FixtureStack {
    sink: Arc<dyn OutputSink>,
    cfg: RuntimeConfig,
    entries: Mutex<Vec<Arc<StackEntry>>>,
    status: Mutex<FixtureStatus>,
}

impl FixtureStack {
    /// `cfg` is the template each fixture's runtime config is derived from;
    /// fixture output goes to `sink`.
    pub fn new(sink: Arc<dyn OutputSink>, cfg: RuntimeConfig) -> Self {
        Self {
            sink,
            cfg,
            entries: Mutex::new(Vec::new()),
            status: Mutex::new(FixtureStatus::Green),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Arc<StackEntry>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: FixtureStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    pub fn status(&self) -> FixtureStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Names of the fixtures on the stack, outermost first.
    pub fn names(&self) -> Vec<String> {
        self.entries().iter().map(|e| e.fixt.name.clone()).collect()
    }

    /// Value of the innermost fixture.
    pub fn val(&self) -> Option<FixtValue> {
        self.entries().last().map(|e| e.value.clone())
    }

    /// Set up `fixt` on top of the stack.
    ///
    /// Only allowed on a green stack. A failed or abandoned set up leaves the
    /// stack red and the fixture is not pushed.
    pub async fn push(&self, ctx: &Context, fixt: Arc<FixtureInstance>) -> FixtureStatus {
        let status = self.status();
        if status != FixtureStatus::Green {
            warn!(fixture = %fixt.name, %status, "Refusing to push onto unhealthy fixture stack");
            return status;
        }

        let (fixt_ctx, cancel) = Context::background().with_cancel();
        let cfg = RuntimeConfig {
            out_dir: self.cfg.out_dir.as_ref().map(|dir| dir.join(&fixt.name)),
            fixt_value: None,
            precondition: PreconditionCarry::new(),
            ..self.cfg.clone()
        };
        let env = FixtureEnv {
            ctx: fixt_ctx,
            parent_value: self.val(),
        };
        let root = EntityRoot::for_fixture(fixt.entity_info(), cfg, env, self.sink.clone());

        let slot: Arc<Mutex<Option<FixtValue>>> = Arc::new(Mutex::new(None));
        let stage = {
            let root = root.clone();
            let fixture = fixt.fixture.clone();
            let slot = slot.clone();
            Stage::new(
                format!("{}:SetUp", fixt.name),
                fixt.set_up_timeout,
                fixt.set_up_timeout + self.cfg.timeouts.exit_timeout,
                move |ctx| async move {
                    let s = root.fixt_state();
                    match fixture.set_up(&ctx, &s).await {
                        Ok(value) => {
                            *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
                        }
                        Err(err) => s.error(("Failed to set up: ", err)),
                    }
                },
            )
        };

        let ctx = ctx.with_logger(root.clone());
        let completed = run_stage(&ctx, stage, root.panic_handler()).await;
        let value = slot.lock().unwrap_or_else(|e| e.into_inner()).take();

        match value {
            Some(value) if completed && !root.has_error() => {
                info!(fixture = %fixt.name, depth = self.len() + 1, "Fixture set up");
                self.entries().push(Arc::new(StackEntry {
                    fixt,
                    root,
                    cancel,
                    value,
                }));
                FixtureStatus::Green
            }
            _ => {
                warn!(fixture = %fixt.name, completed, "Fixture set up failed");
                cancel.cancel();
                root.close_output();
                self.set_status(FixtureStatus::Red);
                FixtureStatus::Red
            }
        }
    }

    /// Tear down the innermost fixture. Returns `false` if the stack was
    /// empty or tear down missed its hard deadline.
    ///
    /// The stack turns green again once it is empty, so popping an empty
    /// stack clears a red status left by a failed push.
    pub async fn pop(&self, ctx: &Context) -> bool {
        let Some(entry) = self.entries().pop() else {
            debug!("Pop on empty fixture stack");
            self.set_status(FixtureStatus::Green);
            return false;
        };

        let stage = {
            let root = entry.root.clone();
            let fixture = entry.fixt.fixture.clone();
            Stage::new(
                format!("{}:TearDown", entry.fixt.name),
                entry.fixt.tear_down_timeout,
                entry.fixt.tear_down_timeout + self.cfg.timeouts.exit_timeout,
                move |ctx| async move {
                    let s = root.fixt_state();
                    fixture.tear_down(&ctx, &s).await;
                },
            )
        };

        let ctx = ctx.with_logger(entry.root.clone());
        let completed = run_stage(&ctx, stage, entry.root.panic_handler()).await;
        entry.cancel.cancel();
        entry.root.close_output();
        debug!(fixture = %entry.fixt.name, completed, "Fixture torn down");

        if self.is_empty() {
            self.set_status(FixtureStatus::Green);
        }
        completed
    }

    /// Reset every fixture, outermost first. A failure turns the stack
    /// yellow.
    pub async fn reset(&self, ctx: &Context) -> FixtureStatus {
        let status = self.status();
        if status != FixtureStatus::Green {
            return status;
        }

        let entries: Vec<_> = self.entries().iter().cloned().collect();
        for entry in entries {
            let failed = Arc::new(AtomicBool::new(false));
            let stage = {
                let root = entry.root.clone();
                let fixture = entry.fixt.fixture.clone();
                let failed = failed.clone();
                Stage::new(
                    format!("{}:Reset", entry.fixt.name),
                    entry.fixt.reset_timeout,
                    entry.fixt.reset_timeout + self.cfg.timeouts.exit_timeout,
                    move |ctx| async move {
                        if let Err(err) = fixture.reset(&ctx).await {
                            failed.store(true, Ordering::SeqCst);
                            root.output().log(&format!("Fixture reset failed: {err:#}"));
                        }
                    },
                )
            };

            let ctx = ctx.with_logger(entry.root.clone());
            let completed = run_stage(&ctx, stage, entry.root.panic_handler()).await;
            if !completed || failed.load(Ordering::SeqCst) || entry.root.has_error() {
                warn!(fixture = %entry.fixt.name, completed, "Fixture reset failed");
                self.set_status(FixtureStatus::Yellow);
                return FixtureStatus::Yellow;
            }
        }
        FixtureStatus::Green
    }

    /// Pre-test and post-test stages for the test owning `test`.
    ///
    /// A pre-test hook is skipped once the test has an error; a post-test
    /// hook runs only if that fixture's pre-test hook did.
    pub fn test_stages(&self, test: &Arc<EntityRoot>) -> TestStages {
        let exit = self.cfg.timeouts.exit_timeout;
        let entries: Vec<_> = self.entries().iter().cloned().collect();
        let ran: Vec<Arc<AtomicBool>> = entries
            .iter()
            .map(|_| Arc::new(AtomicBool::new(false)))
            .collect();

        let pre = entries
            .iter()
            .zip(&ran)
            .map(|(entry, ran)| {
                let test = test.clone();
                let fixture = entry.fixt.fixture.clone();
                let name = entry.fixt.name.clone();
                let ran = ran.clone();
                Stage::new(
                    format!("{}:PreTest", entry.fixt.name),
                    entry.fixt.pre_test_timeout,
                    entry.fixt.pre_test_timeout + exit,
                    move |ctx| async move {
                        if test.has_error() {
                            return;
                        }
                        ran.store(true, Ordering::SeqCst);
                        let s = test.fixt_test_state(name);
                        fixture.pre_test(&ctx, &s).await;
                    },
                )
            })
            .collect();

        let post = entries
            .iter()
            .zip(&ran)
            .rev()
            .map(|(entry, ran)| {
                let test = test.clone();
                let fixture = entry.fixt.fixture.clone();
                let name = entry.fixt.name.clone();
                let ran = ran.clone();
                Stage::new(
                    format!("{}:PostTest", entry.fixt.name),
                    entry.fixt.post_test_timeout,
                    entry.fixt.post_test_timeout + exit,
                    move |ctx| async move {
                        if !ran.load(Ordering::SeqCst) {
                            return;
                        }
                        let s = test.fixt_test_state(name);
                        fixture.post_test(&ctx, &s).await;
                    },
                )
            })
            .collect();

        TestStages { pre, post }
    }
}

impl fmt::Debug for FixtureStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureStack")
            .field("fixtures", &self.names())
            .field("status", &self.status())
            .finish()
    }
}
