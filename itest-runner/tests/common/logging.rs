/// Install the shared JSONL and libtest logging once per test binary.
pub fn init_test_logging() {
    itest_common::testing::init_global_test_logging();
}

#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        tracing::info!(target: "test", $($arg)*);
    };
}
