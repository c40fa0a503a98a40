//! End-to-end tests of `TestInstance::run` and the fixture stack.

#[path = "../common/mod.rs"]
mod common;

mod fixture_tests;
mod hook_tests;
mod runner_tests;
