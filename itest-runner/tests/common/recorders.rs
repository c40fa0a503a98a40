use async_trait::async_trait;
use itest_common::{Context, TimeoutConfig};
use itest_runner::prelude::*;
use itest_runner::{FixtValue, Fixture, PreValue, Precondition, RemoteDevice};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub fn short_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        hook_timeout: Duration::from_secs(2),
        exit_timeout: Duration::from_secs(1),
    }
}

/// Counts prepare/close calls and remembers the contexts it saw.
pub struct RecordingPrecondition {
    name: String,
    pub prepares: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_prepare: bool,
    pub close_contexts: Mutex<Vec<Context>>,
    timeout: Duration,
    /// Extra time spent in prepare/close, ignoring the stage context.
    prepare_stall: Duration,
    close_stall: Duration,
}

impl RecordingPrecondition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            prepares: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fail_prepare: false,
            close_contexts: Mutex::new(Vec::new()),
            timeout: Duration::from_secs(2),
            prepare_stall: Duration::ZERO,
            close_stall: Duration::ZERO,
        }
    }

    /// Prepare outlives its `timeout` by `stall`.
    pub fn stalling_prepare(name: &str, timeout: Duration, stall: Duration) -> Self {
        Self {
            timeout,
            prepare_stall: stall,
            ..Self::new(name)
        }
    }

    /// Close outlives its `timeout` by `stall`.
    pub fn stalling_close(name: &str, timeout: Duration, stall: Duration) -> Self {
        Self {
            timeout,
            close_stall: stall,
            ..Self::new(name)
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail_prepare: true,
            ..Self::new(name)
        }
    }

    pub fn prepares(&self) -> usize {
        self.prepares.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Precondition for RecordingPrecondition {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn prepare(&self, _ctx: &Context, s: &PreState) -> anyhow::Result<PreValue> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        s.log(format!("Preparing {}", self.name));
        tokio::time::sleep(self.prepare_stall).await;
        if self.fail_prepare {
            anyhow::bail!("user session unavailable");
        }
        Ok(Arc::new(format!("{}-value", self.name)))
    }

    async fn close(&self, _ctx: &Context, s: &PreState) -> anyhow::Result<()> {
        if let Some(ctx) = s.pre_ctx() {
            self.close_contexts.lock().unwrap().push(ctx);
        }
        tokio::time::sleep(self.close_stall).await;
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A device that starts disconnected.
pub struct RecordingDevice {
    connected: AtomicBool,
    pub connects: AtomicUsize,
    pub refuse: bool,
}

impl RecordingDevice {
    pub fn disconnected() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            refuse: false,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            refuse: true,
            ..Self::disconnected()
        }
    }
}

#[async_trait]
impl RemoteDevice for RecordingDevice {
    async fn connected(&self, _ctx: &Context) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self, _ctx: &Context) -> anyhow::Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            anyhow::bail!("link down");
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Fixture whose value is its own name.
#[derive(Default)]
pub struct RecordingFixture {
    pub pre_tests: AtomicUsize,
    pub post_tests: AtomicUsize,
    pub tear_downs: AtomicUsize,
}

#[async_trait]
impl Fixture for RecordingFixture {
    async fn set_up(&self, _ctx: &Context, s: &FixtState) -> anyhow::Result<FixtValue> {
        Ok(Arc::new(s.name().to_string()))
    }

    async fn pre_test(&self, _ctx: &Context, s: &FixtTestState) {
        self.pre_tests.fetch_add(1, Ordering::SeqCst);
        s.log(format!("{} ready for {}", s.fixture_name(), s.test_name()));
    }

    async fn post_test(&self, _ctx: &Context, _s: &FixtTestState) {
        self.post_tests.fetch_add(1, Ordering::SeqCst);
    }

    async fn tear_down(&self, _ctx: &Context, _s: &FixtState) {
        self.tear_downs.fetch_add(1, Ordering::SeqCst);
    }
}
