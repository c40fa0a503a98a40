//! Process-wide test logging.
//!
//! The first call to [`init_global_test_logging`] installs a subscriber with
//! two layers: JSON lines appended to `target/test-logs/all_tests.jsonl`, and
//! compact text through the libtest writer so output shows up only for
//! failing tests. Later calls do nothing, so every test can call it first:
//!
//! ```ignore
//! #[tokio::test]
//! async fn stage_times_out() {
//!     itest_common::testing::init_global_test_logging();
//!     // ...
//! }
//! ```
//!
//! `ITEST_TEST_LOG_FILE` moves the JSON file; `ITEST_TEST_LOG_LEVEL` sets the
//! level for the itest crates and the `test` target (default `info`).

use std::fs::File;
use std::path::PathBuf;
use std::sync::{Mutex, Once};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

static INIT: Once = Once::new();

const TARGETS: [&str; 3] = ["itest_common", "itest_runner", "test"];

pub fn init_global_test_logging() {
    INIT.call_once(|| {
        let json_layer = open_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        });
        let text_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .compact();

        let subscriber = tracing_subscriber::registry()
            .with(test_filter())
            .with(json_layer)
            .with(text_layer);
        // Another harness may already own the global subscriber.
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn test_filter() -> EnvFilter {
    let level = std::env::var("ITEST_TEST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let directives = TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn log_file_path() -> PathBuf {
    match std::env::var_os("ITEST_TEST_LOG_FILE") {
        Some(path) => PathBuf::from(path),
        None => find_target_dir().join("test-logs").join("all_tests.jsonl"),
    }
}

/// Logging is best effort: an unwritable location just disables the JSON layer.
fn open_log_file() -> Option<File> {
    let path = log_file_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok()?;
    }
    File::create(path).ok()
}

/// `CARGO_TARGET_DIR`, else the nearest `target/` above the working
/// directory, else a relative `target`.
pub fn find_target_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("CARGO_TARGET_DIR") {
        return PathBuf::from(dir);
    }
    std::env::current_dir()
        .ok()
        .and_then(|cwd| {
            cwd.ancestors()
                .map(|dir| dir.join("target"))
                .find(|candidate| candidate.is_dir())
        })
        .unwrap_or_else(|| PathBuf::from("target"))
}
