//! Helpers for tests of crates built on the runner.

pub mod log;

pub use log::{find_target_dir, init_global_test_logging};
