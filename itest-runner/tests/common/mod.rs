pub mod logging;
pub mod recorders;

pub use logging::init_test_logging;
pub use recorders::{RecordingDevice, RecordingFixture, RecordingPrecondition, short_timeouts};
