//! Entity state shared by every phase of one entity invocation.
//!
//! An [`EntityRoot`] owns the output stream and error flag of a single test
//! or fixture run. User callbacks never see it directly; they get one of the
//! capability views in [`views`], each exposing only what its phase may use.

mod scope;
mod views;

pub use scope::{DataAccess, EntityMeta, EntityScoped, Logger, OutDirAccess, Reporter, Scope};
pub use views::{FixtState, FixtTestState, PreState, State, TestHookState};

use crate::dut::RemoteDevice;
use crate::fixture::FixtValue;
use crate::instance::RuntimeConfig;
use crate::stage::PanicHandler;
use itest_common::{Context, ContextLogger, EntityOutput, OutputSink};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Test,
    Fixture,
}

/// Static description of an entity.
#[derive(Debug, Clone)]
pub struct EntityInfo {
    pub name: String,
    pub kind: EntityKind,
    /// Declared data files, relative to the data directory.
    pub data: Vec<String>,
    /// Declared runtime variables.
    pub vars: Vec<String>,
    pub software_deps: Vec<String>,
    pub service_deps: Vec<String>,
}

impl EntityInfo {
    pub fn new(name: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            name: name.into(),
            kind,
            data: Vec::new(),
            vars: Vec::new(),
            software_deps: Vec::new(),
            service_deps: Vec::new(),
        }
    }
}

/// Monotonic error flag. Once set it stays set, and setting it also sets
/// every ancestor's flag.
#[derive(Debug, Default)]
pub struct EntityCondition {
    failed: AtomicBool,
    parent: Option<Arc<EntityCondition>>,
}

impl EntityCondition {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn child(parent: &Arc<EntityCondition>) -> Self {
        Self {
            failed: AtomicBool::new(false),
            parent: Some(parent.clone()),
        }
    }

    pub fn record_error(&self) {
        self.failed.store(true, Ordering::SeqCst);
        if let Some(parent) = &self.parent {
            parent.record_error();
        }
    }

    pub fn has_error(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

pub(crate) struct FixtureEnv {
    pub ctx: Context,
    pub parent_value: Option<FixtValue>,
}

/// Per-invocation state shared by all views of one entity.
pub struct EntityRoot {
    info: EntityInfo,
    cfg: RuntimeConfig,
    fixture: Option<FixtureEnv>,
    out: EntityOutput,
    condition: Arc<EntityCondition>,
}

impl EntityRoot {
    pub fn new(info: EntityInfo, cfg: RuntimeConfig, sink: Arc<dyn OutputSink>) -> Arc<Self> {
        Arc::new(Self {
            info,
            cfg,
            fixture: None,
            out: EntityOutput::new(sink),
            condition: Arc::new(EntityCondition::new()),
        })
    }

    pub(crate) fn for_fixture(
        info: EntityInfo,
        cfg: RuntimeConfig,
        env: FixtureEnv,
        sink: Arc<dyn OutputSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            cfg,
            fixture: Some(env),
            out: EntityOutput::new(sink),
            condition: Arc::new(EntityCondition::new()),
        })
    }

    pub fn info(&self) -> &EntityInfo {
        &self.info
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.cfg
    }

    pub fn out_dir(&self) -> Option<&Path> {
        self.cfg.out_dir.as_deref()
    }

    pub fn dut(&self) -> Option<&Arc<dyn RemoteDevice>> {
        self.cfg.dut.as_ref()
    }

    pub(crate) fn fixture_env(&self) -> Option<&FixtureEnv> {
        self.fixture.as_ref()
    }

    pub fn condition(&self) -> &Arc<EntityCondition> {
        &self.condition
    }

    pub fn has_error(&self) -> bool {
        self.condition.has_error()
    }

    pub(crate) fn output(&self) -> &EntityOutput {
        &self.out
    }

    /// Stop forwarding output. Later writes from abandoned callbacks are
    /// dropped. Returns `true` for the call that closed it.
    pub fn close_output(&self) -> bool {
        self.out.close()
    }

    pub fn test_state(self: &Arc<Self>) -> State {
        State::new(Scope::new(self.clone()))
    }

    pub fn pre_state(self: &Arc<Self>) -> PreState {
        PreState::new(Scope::new(self.clone()).with_phase(scope::PRECONDITION_PREFIX))
    }

    pub fn hook_state(self: &Arc<Self>) -> TestHookState {
        TestHookState::new(Scope::new(self.clone()))
    }

    pub(crate) fn fixt_state(self: &Arc<Self>) -> FixtState {
        FixtState::new(Scope::new(self.clone()).with_phase(scope::FIXTURE_PREFIX))
    }

    /// View handed to a fixture's per-test hooks; reports land on this
    /// (the test's) root.
    pub fn fixt_test_state(self: &Arc<Self>, fixture: impl Into<String>) -> FixtTestState {
        FixtTestState::new(Scope::new(self.clone()), fixture.into())
    }

    /// Records panics raised by stage callbacks as errors on this entity.
    pub(crate) fn panic_handler(self: &Arc<Self>) -> PanicHandler {
        let root = self.clone();
        Arc::new(move |stage: &str, message: String| {
            tracing::debug!(entity = %root.info.name, stage, "Stage panicked");
            Scope::new(root.clone()).report_panic(message);
        })
    }
}

impl ContextLogger for EntityRoot {
    fn log(&self, msg: &str) {
        self.out.log(msg);
    }
}
