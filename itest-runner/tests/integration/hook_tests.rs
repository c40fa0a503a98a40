use crate::common::{init_test_logging, short_timeouts};
use itest_common::{Context, MemorySink};
use itest_runner::prelude::*;
use itest_runner::{post_test_closure, post_test_hook, pre_test_hook};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Trace = Arc<Mutex<Vec<String>>>;

fn push(trace: &Trace, entry: &str) {
    trace.lock().unwrap().push(entry.to_string());
}

fn traced_test(trace: &Trace) -> Arc<TestInstance> {
    let trace = trace.clone();
    Arc::new(
        TestInstance::new("example.Hooks", move |_ctx, _s| {
            let trace = trace.clone();
            async move { push(&trace, "body") }
        })
        .with_timeout(Duration::from_secs(5)),
    )
}

fn hooks(trace: &Trace) -> TestConfig {
    let pre_trace = trace.clone();
    let post_trace = trace.clone();
    TestConfig {
        pre_test_hook: Some(pre_test_hook(move |_ctx, s| {
            let trace = pre_trace.clone();
            async move {
                push(&trace, &format!("pre-hook {}", s.name()));
                let closure_trace = trace.clone();
                Some(post_test_closure(move |_ctx, _s| async move {
                    push(&closure_trace, "closure");
                }))
            }
        })),
        post_test_hook: Some(post_test_hook(move |_ctx, _s| {
            let trace = post_trace.clone();
            async move { push(&trace, "post-hook") }
        })),
        ..TestConfig::default()
    }
}

#[tokio::test]
async fn hooks_wrap_the_body_in_order() {
    init_test_logging();
    crate::test_log!("TEST START: hooks_wrap_the_body_in_order");

    let trace: Trace = Arc::default();
    let sink = Arc::new(MemorySink::new());
    let rcfg = RuntimeConfig {
        timeouts: short_timeouts(),
        ..RuntimeConfig::default()
    };

    let completed = traced_test(&trace)
        .run(&Context::background(), sink.clone(), hooks(&trace), rcfg)
        .await;

    assert!(completed);
    assert_eq!(
        *trace.lock().unwrap(),
        vec!["pre-hook example.Hooks", "body", "post-hook", "closure"]
    );

    crate::test_log!("TEST PASS: hooks_wrap_the_body_in_order");
}

#[tokio::test]
async fn pre_hook_error_skips_body_but_not_post_hooks() {
    init_test_logging();

    let trace: Trace = Arc::default();
    let sink = Arc::new(MemorySink::new());
    let post_trace = trace.clone();
    let tcfg = TestConfig {
        pre_test_hook: Some(pre_test_hook(|_ctx, s| async move {
            s.error("Device is in a bad state");
            None
        })),
        post_test_hook: Some(post_test_hook(move |_ctx, _s| {
            let trace = post_trace.clone();
            async move { push(&trace, "post-hook") }
        })),
        ..TestConfig::default()
    };
    let rcfg = RuntimeConfig {
        timeouts: short_timeouts(),
        ..RuntimeConfig::default()
    };

    let completed = traced_test(&trace)
        .run(&Context::background(), sink.clone(), tcfg, rcfg)
        .await;

    assert!(completed);
    assert_eq!(*trace.lock().unwrap(), vec!["post-hook"]);
    assert_eq!(sink.errors()[0].reason, "Device is in a bad state");
}

#[tokio::test]
async fn hung_pre_hook_abandons_the_test() {
    init_test_logging();

    let trace: Trace = Arc::default();
    let sink = Arc::new(MemorySink::new());
    let tcfg = TestConfig {
        pre_test_hook: Some(pre_test_hook(|_ctx, _s| std::future::pending())),
        ..TestConfig::default()
    };
    let rcfg = RuntimeConfig {
        timeouts: itest_common::TimeoutConfig {
            hook_timeout: Duration::from_millis(10),
            exit_timeout: Duration::from_millis(50),
        },
        ..RuntimeConfig::default()
    };

    let completed = traced_test(&trace)
        .run(&Context::background(), sink.clone(), tcfg, rcfg)
        .await;

    assert!(!completed);
    assert!(trace.lock().unwrap().is_empty());
}
