use crate::common::{RecordingDevice, init_test_logging, short_timeouts};
use itest_common::{ChannelSink, Context, MemorySink, OutputEvent};
use itest_runner::prelude::*;
use itest_runner::post_test_hook;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn runtime() -> RuntimeConfig {
    RuntimeConfig {
        timeouts: short_timeouts(),
        ..RuntimeConfig::default()
    }
}

#[tokio::test]
async fn passing_test_completes_cleanly() {
    init_test_logging();
    crate::test_log!("TEST START: passing_test_completes_cleanly");

    let sink = Arc::new(MemorySink::new());
    let test = Arc::new(
        TestInstance::new("example.Pass", |ctx, s| async move {
            s.log("hello");
            assert!(ctx.log("via context"));
        })
        .with_timeout(Duration::from_secs(5)),
    );

    let completed = test
        .run(&Context::background(), sink.clone(), TestConfig::default(), runtime())
        .await;

    assert!(completed);
    assert!(sink.errors().is_empty());
    assert_eq!(sink.logs(), vec!["hello", "via context"]);

    crate::test_log!("TEST PASS: passing_test_completes_cleanly");
}

#[tokio::test]
async fn runaway_body_is_abandoned_within_grace() {
    init_test_logging();
    crate::test_log!("TEST START: runaway_body_is_abandoned_within_grace");

    let sink = Arc::new(MemorySink::new());
    let post_ran = Arc::new(AtomicBool::new(false));
    let test = Arc::new(
        TestInstance::new("example.Hang", |_ctx, s| async move {
            loop {
                s.log("still going");
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .with_timeout(Duration::from_millis(1))
        .with_exit_timeout(Duration::from_millis(200)),
    );
    let flag = post_ran.clone();
    let tcfg = TestConfig {
        post_test_hook: Some(post_test_hook(move |_ctx, _s| {
            let flag = flag.clone();
            async move { flag.store(true, Ordering::SeqCst) }
        })),
        ..TestConfig::default()
    };

    let started = Instant::now();
    let completed = test
        .run(&Context::background(), sink.clone(), tcfg, runtime())
        .await;

    assert!(!completed);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!post_ran.load(Ordering::SeqCst));

    // The abandoned body keeps logging, but its output is closed.
    let logged = sink.logs().len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.logs().len(), logged);

    crate::test_log!("TEST PASS: runaway_body_is_abandoned_within_grace");
}

#[tokio::test]
async fn cooperative_body_sees_soft_deadline() {
    init_test_logging();

    let sink = Arc::new(MemorySink::new());
    let test = Arc::new(
        TestInstance::new("example.Cooperative", |ctx, s| async move {
            ctx.done().await;
            s.error(format!("Saw timeout: {:?}", ctx.err()));
        })
        .with_timeout(Duration::from_millis(20)),
    );

    let completed = test
        .run(&Context::background(), sink.clone(), TestConfig::default(), runtime())
        .await;

    assert!(completed);
    assert_eq!(sink.errors()[0].reason, "Saw timeout: Some(DeadlineExceeded)");
}

#[tokio::test]
async fn missing_timeout_skips_body() {
    init_test_logging();

    let sink = Arc::new(MemorySink::new());
    let body_ran = Arc::new(AtomicBool::new(false));
    let flag = body_ran.clone();
    let test = Arc::new(TestInstance::new("example.NoTimeout", move |_ctx, _s| {
        let flag = flag.clone();
        async move { flag.store(true, Ordering::SeqCst) }
    }));

    let completed = test
        .run(&Context::background(), sink.clone(), TestConfig::default(), runtime())
        .await;

    assert!(completed);
    assert!(!body_ran.load(Ordering::SeqCst));
    assert!(sink.errors()[0].reason.starts_with("Invalid timeout"));
}

#[tokio::test]
async fn missing_data_files_are_reported_and_body_skipped() {
    init_test_logging();
    crate::test_log!("TEST START: missing_data_files_are_reported_and_body_skipped");

    let data_dir = tempfile::tempdir().unwrap();
    std::fs::write(data_dir.path().join("present.txt"), "ok").unwrap();
    std::fs::write(
        data_dir.path().join("model.bin.external-error"),
        "download failed: 404\n",
    )
    .unwrap();

    let sink = Arc::new(MemorySink::new());
    let body_ran = Arc::new(AtomicBool::new(false));
    let flag = body_ran.clone();
    let test = Arc::new(
        TestInstance::new("example.Data", move |_ctx, _s| {
            let flag = flag.clone();
            async move { flag.store(true, Ordering::SeqCst) }
        })
        .with_timeout(Duration::from_secs(5))
        .with_data(["present.txt", "model.bin", "gone.txt"]),
    );
    let rcfg = RuntimeConfig {
        data_dir: data_dir.path().to_path_buf(),
        ..runtime()
    };

    let completed = test
        .run(&Context::background(), sink.clone(), TestConfig::default(), rcfg)
        .await;

    assert!(completed);
    assert!(!body_ran.load(Ordering::SeqCst));
    let reasons: Vec<_> = sink.errors().into_iter().map(|e| e.reason).collect();
    assert_eq!(
        reasons,
        vec![
            "Required data file model.bin missing: download failed: 404",
            "Required data file gone.txt missing",
        ]
    );

    crate::test_log!("TEST PASS: missing_data_files_are_reported_and_body_skipped");
}

#[tokio::test]
async fn declared_data_file_resolves_under_data_dir() {
    init_test_logging();

    let data_dir = tempfile::tempdir().unwrap();
    std::fs::write(data_dir.path().join("input.json"), "{}").unwrap();
    let expected = data_dir.path().join("input.json");

    let sink = Arc::new(MemorySink::new());
    let test = Arc::new(
        TestInstance::new("example.DataPath", move |_ctx, s| {
            let expected = expected.clone();
            async move {
                if s.data_path("input.json") != expected {
                    s.error("Wrong data path");
                }
            }
        })
        .with_timeout(Duration::from_secs(5))
        .with_data(["input.json"]),
    );
    let rcfg = RuntimeConfig {
        data_dir: data_dir.path().to_path_buf(),
        ..runtime()
    };

    assert!(
        test.run(&Context::background(), sink.clone(), TestConfig::default(), rcfg)
            .await
    );
    assert!(sink.errors().is_empty());
}

#[tokio::test]
async fn out_dir_is_created_for_the_body() {
    init_test_logging();

    let root = tempfile::tempdir().unwrap();
    let out_dir = root.path().join("example.Out");
    let sink = Arc::new(MemorySink::new());
    let test = Arc::new(
        TestInstance::new("example.Out", |_ctx, s| async move {
            let Some(dir) = s.out_dir() else {
                s.fatal("No output directory");
            };
            if let Err(err) = std::fs::write(dir.join("result.txt"), "done") {
                s.error(("Failed to write result: ", err));
            }
        })
        .with_timeout(Duration::from_secs(5)),
    );
    let rcfg = RuntimeConfig {
        out_dir: Some(out_dir.clone()),
        ..runtime()
    };

    assert!(
        test.run(&Context::background(), sink.clone(), TestConfig::default(), rcfg)
            .await
    );
    assert!(sink.errors().is_empty());
    assert_eq!(
        std::fs::read_to_string(out_dir.join("result.txt")).unwrap(),
        "done"
    );
}

#[tokio::test]
async fn disconnected_dut_is_reconnected_in_setup() {
    init_test_logging();

    let sink = Arc::new(MemorySink::new());
    let device = Arc::new(RecordingDevice::disconnected());
    let test = Arc::new(
        TestInstance::new("example.Dut", |ctx, s| async move {
            let Some(dut) = s.dut() else {
                s.fatal("No DUT");
            };
            if !dut.connected(&ctx).await {
                s.error("DUT still disconnected");
            }
        })
        .with_timeout(Duration::from_secs(5)),
    );
    let rcfg = RuntimeConfig {
        dut: Some(device.clone()),
        ..runtime()
    };

    assert!(
        test.run(&Context::background(), sink.clone(), TestConfig::default(), rcfg)
            .await
    );
    assert_eq!(device.connects.load(Ordering::SeqCst), 1);
    assert!(sink.errors().is_empty());
    assert!(sink.logs().iter().any(|l| l == "Reconnecting to DUT"));
}

#[tokio::test]
async fn unreachable_dut_fails_setup() {
    init_test_logging();

    let sink = Arc::new(MemorySink::new());
    let body_ran = Arc::new(AtomicBool::new(false));
    let flag = body_ran.clone();
    let test = Arc::new(
        TestInstance::new("example.DutDown", move |_ctx, _s| {
            let flag = flag.clone();
            async move { flag.store(true, Ordering::SeqCst) }
        })
        .with_timeout(Duration::from_secs(5)),
    );
    let rcfg = RuntimeConfig {
        dut: Some(Arc::new(RecordingDevice::unreachable())),
        ..runtime()
    };

    assert!(
        test.run(&Context::background(), sink.clone(), TestConfig::default(), rcfg)
            .await
    );
    assert!(!body_ran.load(Ordering::SeqCst));
    assert_eq!(
        sink.errors()[0].reason,
        "Failed to reconnect to DUT: link down"
    );
}

#[tokio::test]
async fn subtest_fatal_fails_only_the_subtest() {
    init_test_logging();
    crate::test_log!("TEST START: subtest_fatal_fails_only_the_subtest");

    let sink = Arc::new(MemorySink::new());
    let test = Arc::new(
        TestInstance::new("example.Subtests", |ctx, s| async move {
            let first = s
                .run(&ctx, "broken", |_ctx, st| async move {
                    st.fatal("cannot continue");
                })
                .await;
            let second = s
                .run(&ctx, "fine", |_ctx, st| async move {
                    st.log("all good");
                })
                .await;
            s.log(format!("results: {first} {second}"));
        })
        .with_timeout(Duration::from_secs(5)),
    );

    assert!(
        test.run(&Context::background(), sink.clone(), TestConfig::default(), runtime())
            .await
    );
    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].reason, "broken: cannot continue");
    assert!(sink.logs().iter().any(|l| l == "results: false true"));

    crate::test_log!("TEST PASS: subtest_fatal_fails_only_the_subtest");
}

#[tokio::test]
async fn concurrent_subtests_share_output_safely() {
    init_test_logging();

    let sink = Arc::new(MemorySink::new());
    let test = Arc::new(
        TestInstance::new("example.Parallel", |ctx, s| async move {
            let runs = (0..8).map(|i| {
                let s = s.clone();
                let ctx = ctx.clone();
                async move {
                    s.run(&ctx, &format!("case{i}"), move |_ctx, st| async move {
                        if i % 2 == 0 {
                            st.error("even case failed");
                        } else {
                            st.log("odd case passed");
                        }
                    })
                    .await
                }
            });
            let results = futures::future::join_all(runs).await;
            let failed = results.iter().filter(|ok| !**ok).count();
            s.log(format!("{failed} failed"));
        })
        .with_timeout(Duration::from_secs(5)),
    );

    assert!(
        test.run(&Context::background(), sink.clone(), TestConfig::default(), runtime())
            .await
    );
    assert_eq!(sink.errors().len(), 4);
    assert!(sink.logs().iter().any(|l| l == "4 failed"));
}

#[tokio::test]
async fn body_panic_is_recorded_and_cleanup_runs() {
    init_test_logging();

    let sink = Arc::new(MemorySink::new());
    let hooks = Arc::new(AtomicUsize::new(0));
    let counter = hooks.clone();
    let test = Arc::new(
        TestInstance::new("example.Panic", |_ctx, _s| async move {
            panic!("index out of range");
        })
        .with_timeout(Duration::from_secs(5)),
    );
    let tcfg = TestConfig {
        post_test_hook: Some(post_test_hook(move |_ctx, s| {
            let counter = counter.clone();
            async move {
                if s.has_error() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        })),
        ..TestConfig::default()
    };

    assert!(
        test.run(&Context::background(), sink.clone(), tcfg, runtime())
            .await
    );
    assert_eq!(sink.errors()[0].reason, "Panic: index out of range");
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn events_stream_through_channel_sink() {
    init_test_logging();

    let (sink, mut rx) = ChannelSink::channel();
    let test = Arc::new(
        TestInstance::new("example.Channel", |_ctx, s| async move {
            s.log("one");
            s.error(("Step failed: ", std::io::Error::other("eof")));
        })
        .with_timeout(Duration::from_secs(5)),
    );

    assert!(
        test.run(&Context::background(), Arc::new(sink), TestConfig::default(), runtime())
            .await
    );

    let events = rx.drain();
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], OutputEvent::Log { text, .. } if text == "one"));
    match &events[1] {
        OutputEvent::Error { error, .. } => {
            assert_eq!(error.reason, "Step failed: eof");
            assert!(error.stack.starts_with("Step failed\n\tat "));
            assert!(error.file.ends_with("runner_tests.rs"));
        }
        other => panic!("expected error event, got {other:?}"),
    }
}
