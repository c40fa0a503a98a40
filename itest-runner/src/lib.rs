//! Entity runner for timed, cancellable integration tests.
//!
//! A test runs as a sequence of [`Stage`]s (setup, precondition prepare,
//! body, precondition close, post-test), each on its own task with a soft
//! deadline seen by the callback and a hard deadline after which the runner
//! stops waiting. User code reports through capability-limited state views;
//! `fatal` ends only the task it was called on.
//!
//! ```ignore
//! use itest_runner::prelude::*;
//!
//! let test = Arc::new(
//!     TestInstance::new("example.Boot", |ctx, s| async move {
//!         if let Err(err) = wait_for_login(&ctx).await {
//!             s.fatal(("Login screen never appeared: ", err));
//!         }
//!     })
//!     .with_timeout(Duration::from_secs(30)),
//! );
//! let completed = test.run(&ctx, sink, TestConfig::default(), rcfg).await;
//! ```

pub mod dut;
pub mod fixture;
pub mod instance;
pub mod message;
pub mod precondition;
pub mod stage;
pub mod state;

pub use dut::RemoteDevice;
pub use fixture::{FixtValue, Fixture, FixtureInstance, FixtureStack, FixtureStatus, TestStages};
pub use instance::{
    PostTestHook, PreTestHook, RuntimeConfig, TestConfig, TestFunc, TestHook, TestInstance,
    post_test_closure, post_test_hook, pre_test_hook,
};
pub use message::Message;
pub use precondition::{PreValue, Precondition, PreconditionCarry, same_precondition};
pub use stage::{PanicHandler, Stage, run_stage, run_stages};
pub use state::{
    EntityCondition, EntityInfo, EntityKind, EntityRoot, FixtState, FixtTestState, PreState,
    State, TestHookState,
};

/// Capability traits and the types most callbacks need.
pub mod prelude {
    pub use crate::state::{DataAccess, EntityMeta, Logger, OutDirAccess, Reporter};
    pub use crate::{
        FixtState, FixtTestState, Message, PreState, RuntimeConfig, State, TestConfig,
        TestHookState, TestInstance,
    };
    pub use itest_common::Context;
}
