//! Per-test phase wiring.
//!
//! [`TestInstance::run`] turns one test into a sequence of stages:
//!
//! | Stage | Runs | Soft timeout |
//! |---|---|---|
//! | setup | always | hook timeout |
//! | precondition prepare | precondition declared, no error yet | precondition timeout |
//! | fixture pre-test | per fixture on the stack, no error yet | fixture's |
//! | body | no error yet | test timeout |
//! | fixture post-test | if that fixture's pre-test ran | fixture's |
//! | precondition close | last test sharing the precondition | precondition timeout |
//! | post-test | always | hook timeout |
//!
//! Every hard timeout is its soft timeout plus the exit grace period. The
//! body uses the test's own exit timeout when it has one.

use crate::dut::RemoteDevice;
use crate::fixture::{FixtValue, FixtureStack};
use crate::precondition::{Precondition, PreconditionCarry, same_precondition};
use crate::stage::{Stage, run_stages};
use crate::state::{
    EntityInfo, EntityKind, EntityRoot, Logger, Reporter, State, TestHookState,
};
use futures::future::BoxFuture;
use itest_common::{Context, OutputSink, RunnerConfig, TimeoutConfig};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{Instrument, debug, info_span, warn};

/// Suffix of the file a data downloader leaves next to a file it failed to
/// fetch. Its contents explain the failure.
pub const EXTERNAL_ERROR_SUFFIX: &str = ".external-error";

pub type TestFunc = Arc<dyn Fn(Context, State) -> BoxFuture<'static, ()> + Send + Sync>;

/// Closure returned by a pre-test hook, run at the end of the post-test stage.
pub type PostTestHook = Box<dyn FnOnce(Context, TestHookState) -> BoxFuture<'static, ()> + Send>;

pub type PreTestHook =
    Arc<dyn Fn(Context, TestHookState) -> BoxFuture<'static, Option<PostTestHook>> + Send + Sync>;

pub type TestHook = Arc<dyn Fn(Context, TestHookState) -> BoxFuture<'static, ()> + Send + Sync>;

pub fn pre_test_hook<F, Fut>(f: F) -> PreTestHook
where
    F: Fn(Context, TestHookState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<PostTestHook>> + Send + 'static,
{
    Arc::new(move |ctx, s| Box::pin(f(ctx, s)))
}

pub fn post_test_hook<F, Fut>(f: F) -> TestHook
where
    F: Fn(Context, TestHookState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx, s| Box::pin(f(ctx, s)))
}

/// Box a closure for a pre-test hook to hand back.
pub fn post_test_closure<F, Fut>(f: F) -> PostTestHook
where
    F: FnOnce(Context, TestHookState) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move |ctx, s| Box::pin(f(ctx, s)))
}

/// A resolved, runnable test.
#[derive(Clone)]
pub struct TestInstance {
    pub name: String,
    pub func: TestFunc,
    pub timeout: Duration,
    /// Overrides the default exit grace period of the body stage.
    pub exit_timeout: Option<Duration>,
    pub data: Vec<String>,
    pub vars: Vec<String>,
    pub software_deps: Vec<String>,
    pub service_deps: Vec<String>,
    pub pre: Option<Arc<dyn Precondition>>,
}

impl TestInstance {
    /// A test with no timeout set; one must be configured before it can run.
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Context, State) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(move |ctx, s| Box::pin(f(ctx, s))),
            timeout: Duration::ZERO,
            exit_timeout: None,
            data: Vec::new(),
            vars: Vec::new(),
            software_deps: Vec::new(),
            service_deps: Vec::new(),
            pre: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_exit_timeout(mut self, exit_timeout: Duration) -> Self {
        self.exit_timeout = Some(exit_timeout);
        self
    }

    #[must_use]
    pub fn with_data<I, S>(mut self, data: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.data = data.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_vars<I, S>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vars = vars.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_software_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.software_deps = deps.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_service_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.service_deps = deps.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_precondition(mut self, pre: Arc<dyn Precondition>) -> Self {
        self.pre = Some(pre);
        self
    }

    fn entity_info(&self) -> EntityInfo {
        EntityInfo {
            data: self.data.clone(),
            vars: self.vars.clone(),
            software_deps: self.software_deps.clone(),
            service_deps: self.service_deps.clone(),
            ..EntityInfo::new(self.name.clone(), EntityKind::Test)
        }
    }

    fn body_exit_timeout(&self, timeouts: &TimeoutConfig) -> Duration {
        self.exit_timeout.unwrap_or(timeouts.exit_timeout)
    }

    /// Upper bound on how long [`run`](Self::run) can take when no fixtures
    /// are involved: every soft timeout plus the largest exit grace period.
    pub fn max_run_duration(&self, timeouts: &TimeoutConfig) -> Duration {
        let pre = self
            .pre
            .as_ref()
            .map(|pre| pre.timeout() * 2)
            .unwrap_or_default();
        let grace = timeouts.exit_timeout.max(self.body_exit_timeout(timeouts));
        timeouts.hook_timeout * 2 + pre + self.timeout + grace
    }

    /// Whether the test after this one keeps the precondition alive.
    fn next_shares_precondition(&self, next: Option<&Arc<TestInstance>>) -> bool {
        match (&self.pre, next.and_then(|t| t.pre.as_ref())) {
            (Some(mine), Some(theirs)) => same_precondition(mine, theirs),
            _ => false,
        }
    }

    /// Run the test. Returns `false` if a stage missed its hard deadline, in
    /// which case later stages were skipped and the caller should report the
    /// test as not finished.
    ///
    /// The test's output is closed before this returns.
    pub async fn run(
        self: &Arc<Self>,
        ctx: &Context,
        out: Arc<dyn OutputSink>,
        tcfg: TestConfig,
        rcfg: RuntimeConfig,
    ) -> bool {
        let span = info_span!("entity", kind = "test", name = %self.name);
        self.run_phases(ctx, out, tcfg, rcfg).instrument(span).await
    }

    async fn run_phases(
        self: &Arc<Self>,
        ctx: &Context,
        out: Arc<dyn OutputSink>,
        tcfg: TestConfig,
        mut rcfg: RuntimeConfig,
    ) -> bool {
        if rcfg.fixt_value.is_none()
            && let Some(stack) = &tcfg.fixtures
        {
            rcfg.fixt_value = stack.val();
        }
        let timeouts = rcfg.timeouts;
        let carry = rcfg.precondition.clone();
        let root = EntityRoot::new(self.entity_info(), rcfg, out);
        let ctx = ctx.with_logger(root.clone());

        let post_closure: Arc<Mutex<Option<PostTestHook>>> = Arc::new(Mutex::new(None));
        let closing_pre = self
            .pre
            .clone()
            .filter(|_| !self.next_shares_precondition(tcfg.next_test.as_ref()));

        let mut stages = vec![self.setup_stage(&root, &tcfg, &post_closure, &timeouts)];
        if let Some(pre) = &self.pre {
            stages.push(prepare_stage(&root, pre, &carry, &timeouts));
        }
        let fixture_stages = tcfg.fixtures.as_ref().map(|stack| stack.test_stages(&root));
        let fixture_post = match fixture_stages {
            Some(fixture_stages) => {
                stages.extend(fixture_stages.pre);
                fixture_stages.post
            }
            None => Vec::new(),
        };
        stages.push(self.body_stage(&root, &timeouts));
        stages.extend(fixture_post);
        if let Some(pre) = &closing_pre {
            stages.push(close_stage(&root, pre, &carry, &timeouts));
        }
        stages.push(post_stage(&root, &tcfg, &post_closure, &timeouts));

        let completed = run_stages(&ctx, stages, root.panic_handler()).await;
        if !completed {
            warn!(test = %self.name, "Test did not finish in time");
        }
        if let Some(pre) = &closing_pre
            && let Some(token) = carry.context_for(pre)
            && carry.release_if(pre, &token)
        {
            debug!(test = %self.name, "Released precondition left open by an unfinished close");
        }
        root.close_output();
        completed
    }

    fn setup_stage(
        self: &Arc<Self>,
        root: &Arc<EntityRoot>,
        tcfg: &TestConfig,
        post_closure: &Arc<Mutex<Option<PostTestHook>>>,
        timeouts: &TimeoutConfig,
    ) -> Stage {
        let test = self.clone();
        let root = root.clone();
        let hook = tcfg.pre_test_hook.clone();
        let post_closure = post_closure.clone();
        Stage::new(
            "setup",
            timeouts.hook_timeout,
            timeouts.hook_timeout + timeouts.exit_timeout,
            move |ctx| async move {
                let s = root.test_state();
                if test.timeout.is_zero() {
                    s.fatal(format!("Invalid timeout {:?}", test.timeout));
                }
                if let Some(dir) = root.out_dir()
                    && let Err(err) = prepare_out_dir(dir)
                {
                    s.fatal(("Failed to create output directory: ", err));
                }
                check_data_files(&s, &test.data, &root.config().data_dir);
                if s.has_error() {
                    return;
                }

                if let Some(dut) = root.dut().cloned() {
                    reconnect_dut(&ctx, &s, dut.as_ref()).await;
                }
                if let Some(hook) = hook {
                    let closure = hook(ctx, root.hook_state()).await;
                    *post_closure.lock().unwrap_or_else(|e| e.into_inner()) = closure;
                }
            },
        )
    }

    fn body_stage(self: &Arc<Self>, root: &Arc<EntityRoot>, timeouts: &TimeoutConfig) -> Stage {
        let test = self.clone();
        let root = root.clone();
        Stage::new(
            "body",
            self.timeout,
            self.timeout + self.body_exit_timeout(timeouts),
            move |ctx| async move {
                if root.has_error() {
                    return;
                }
                (test.func)(ctx, root.test_state()).await;
            },
        )
    }
}

impl fmt::Debug for TestInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestInstance")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("exit_timeout", &self.exit_timeout)
            .field("data", &self.data)
            .field("vars", &self.vars)
            .field("precondition", &self.pre.as_ref().map(|p| p.name().to_string()))
            .finish_non_exhaustive()
    }
}

fn prepare_stage(
    root: &Arc<EntityRoot>,
    pre: &Arc<dyn Precondition>,
    carry: &PreconditionCarry,
    timeouts: &TimeoutConfig,
) -> Stage {
    let root = root.clone();
    let pre = pre.clone();
    let carry = carry.clone();
    Stage::new(
        "precondition prepare",
        pre.timeout(),
        pre.timeout() + timeouts.exit_timeout,
        move |ctx| async move {
            if root.has_error() {
                return;
            }
            let s = root.pre_state();
            let (token, prepared) = carry.acquire(&pre);
            if prepared.is_some() {
                debug!(precondition = pre.name(), "Reusing prepared precondition");
                return;
            }
            match pre.prepare(&ctx, &s).await {
                Ok(value) => {
                    carry.set_value(&pre, &token, value);
                }
                Err(err) => s.error(("Failed to prepare: ", err)),
            }
        },
    )
}

fn close_stage(
    root: &Arc<EntityRoot>,
    pre: &Arc<dyn Precondition>,
    carry: &PreconditionCarry,
    timeouts: &TimeoutConfig,
) -> Stage {
    let root = root.clone();
    let pre = pre.clone();
    let carry = carry.clone();
    Stage::new(
        "precondition close",
        pre.timeout(),
        pre.timeout() + timeouts.exit_timeout,
        move |ctx| async move {
            // Taken before close runs: if this stage is abandoned, a later
            // test may rebind the carry before close returns.
            let token = carry.context_for(&pre);
            let s = root.pre_state();
            if let Err(err) = pre.close(&ctx, &s).await {
                s.error(("Failed to close: ", err));
            }
            if let Some(token) = token {
                carry.release_if(&pre, &token);
            }
        },
    )
}

fn post_stage(
    root: &Arc<EntityRoot>,
    tcfg: &TestConfig,
    post_closure: &Arc<Mutex<Option<PostTestHook>>>,
    timeouts: &TimeoutConfig,
) -> Stage {
    let root = root.clone();
    let hook = tcfg.post_test_hook.clone();
    let post_closure = post_closure.clone();
    Stage::new(
        "post-test",
        timeouts.hook_timeout,
        timeouts.hook_timeout + timeouts.exit_timeout,
        move |ctx| async move {
            if let Some(hook) = hook {
                hook(ctx.clone(), root.hook_state()).await;
            }
            let closure = post_closure
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(closure) = closure {
                closure(ctx, root.hook_state()).await;
            }
        },
    )
}

async fn reconnect_dut(ctx: &Context, s: &State, dut: &dyn RemoteDevice) {
    if dut.connected(ctx).await {
        return;
    }
    s.log("Reconnecting to DUT");
    if let Err(err) = dut.connect(ctx).await {
        s.fatal(("Failed to reconnect to DUT: ", err));
    }
}

/// Create the output directory, world-writable with the sticky bit so
/// helpers running as other users can drop files into it.
fn prepare_out_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o1777))?;
    }
    Ok(())
}

pub fn external_error_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(EXTERNAL_ERROR_SUFFIX);
    PathBuf::from(name)
}

fn check_data_files(s: &State, data: &[String], data_dir: &Path) {
    for name in data {
        let path = data_dir.join(name);
        if path.exists() {
            continue;
        }
        match std::fs::read_to_string(external_error_path(&path)) {
            Ok(reason) => s.errorf(format_args!(
                "Required data file {name} missing: {}",
                reason.trim_end()
            )),
            Err(_) => s.errorf(format_args!("Required data file {name} missing")),
        }
    }
}

/// Per-run wiring supplied by the caller scheduling a sequence of tests.
#[derive(Clone, Default)]
pub struct TestConfig {
    pub pre_test_hook: Option<PreTestHook>,
    pub post_test_hook: Option<TestHook>,
    /// The test that will run right after this one, used to decide whether
    /// the precondition must be closed.
    pub next_test: Option<Arc<TestInstance>>,
    pub fixtures: Option<Arc<FixtureStack>>,
}

impl fmt::Debug for TestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestConfig")
            .field("pre_test_hook", &self.pre_test_hook.is_some())
            .field("post_test_hook", &self.post_test_hook.is_some())
            .field("next_test", &self.next_test.as_ref().map(|t| t.name.as_str()))
            .field("fixtures", &self.fixtures)
            .finish()
    }
}

/// Environment one entity invocation runs in.
#[derive(Clone, Default)]
pub struct RuntimeConfig {
    pub data_dir: PathBuf,
    /// Where the entity writes its own files. Created during setup.
    pub out_dir: Option<PathBuf>,
    pub vars: HashMap<String, String>,
    pub dut: Option<Arc<dyn RemoteDevice>>,
    pub precondition: PreconditionCarry,
    /// Normally taken from the fixture stack.
    pub fixt_value: Option<FixtValue>,
    pub timeouts: TimeoutConfig,
}

impl RuntimeConfig {
    /// Runtime config for `entity` under the process-level config. The
    /// entity's output directory is a subdirectory named after it.
    pub fn from_runner_config(cfg: &RunnerConfig, entity: &str) -> Self {
        Self {
            data_dir: cfg.data_dir.clone(),
            out_dir: cfg.out_dir.as_ref().map(|dir| dir.join(entity)),
            timeouts: cfg.timeouts,
            ..Self::default()
        }
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("data_dir", &self.data_dir)
            .field("out_dir", &self.out_dir)
            .field("vars", &self.vars.keys().collect::<Vec<_>>())
            .field("dut", &self.dut.is_some())
            .field("precondition", &self.precondition)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}
