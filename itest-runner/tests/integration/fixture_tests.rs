use crate::common::{RecordingFixture, init_test_logging, short_timeouts};
use itest_common::{Context, MemorySink};
use itest_runner::prelude::*;
use itest_runner::{FixtureInstance, FixtureStack, FixtureStatus};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn runtime() -> RuntimeConfig {
    RuntimeConfig {
        timeouts: short_timeouts(),
        ..RuntimeConfig::default()
    }
}

#[tokio::test]
async fn test_runs_inside_fixture_stack() {
    init_test_logging();
    crate::test_log!("TEST START: test_runs_inside_fixture_stack");

    let ctx = Context::background();
    let fixture_sink = Arc::new(MemorySink::new());
    let stack = Arc::new(FixtureStack::new(fixture_sink.clone(), runtime()));
    let fixture = Arc::new(RecordingFixture::default());
    let status = stack
        .push(&ctx, Arc::new(FixtureInstance::new("chromeLoggedIn", fixture.clone())))
        .await;
    assert_eq!(status, FixtureStatus::Green);

    let sink = Arc::new(MemorySink::new());
    let test = Arc::new(
        TestInstance::new("example.Fixt", |_ctx, s| async move {
            match s.fixt_value::<String>() {
                Some(value) => s.log(format!("fixture value {value}")),
                None => s.error("No fixture value"),
            }
        })
        .with_timeout(Duration::from_secs(5)),
    );
    let tcfg = TestConfig {
        fixtures: Some(stack.clone()),
        ..TestConfig::default()
    };

    assert!(test.run(&ctx, sink.clone(), tcfg, runtime()).await);
    assert!(sink.errors().is_empty());
    assert_eq!(
        sink.logs(),
        vec![
            "chromeLoggedIn ready for example.Fixt",
            "fixture value chromeLoggedIn",
        ]
    );
    assert_eq!(fixture.pre_tests.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.post_tests.load(Ordering::SeqCst), 1);

    assert_eq!(stack.reset(&ctx).await, FixtureStatus::Green);
    assert!(stack.pop(&ctx).await);
    assert_eq!(fixture.tear_downs.load(Ordering::SeqCst), 1);
    assert!(fixture_sink.errors().is_empty());

    crate::test_log!("TEST PASS: test_runs_inside_fixture_stack");
}

#[tokio::test]
async fn setup_failure_skips_fixture_hooks() {
    init_test_logging();

    let ctx = Context::background();
    let stack = Arc::new(FixtureStack::new(Arc::new(MemorySink::new()), runtime()));
    let fixture = Arc::new(RecordingFixture::default());
    stack
        .push(&ctx, Arc::new(FixtureInstance::new("arc", fixture.clone())))
        .await;

    let sink = Arc::new(MemorySink::new());
    // No timeout configured, so setup fails.
    let test = Arc::new(TestInstance::new("example.NoTimeout", |_ctx, _s| async {}));
    let tcfg = TestConfig {
        fixtures: Some(stack.clone()),
        ..TestConfig::default()
    };

    assert!(test.run(&ctx, sink.clone(), tcfg, runtime()).await);
    assert_eq!(sink.errors().len(), 1);
    assert_eq!(fixture.pre_tests.load(Ordering::SeqCst), 0);
    assert_eq!(fixture.post_tests.load(Ordering::SeqCst), 0);
    stack.pop(&ctx).await;
}
