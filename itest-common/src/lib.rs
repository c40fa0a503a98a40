//! Shared building blocks for the itest entity runner.
//!
//! This crate holds the pieces every runner component needs but that carry no
//! execution policy of their own: the cancellable [`Context`], the output sink
//! family, configuration loading and `tracing` setup.

pub mod config;
pub mod context;
pub mod errors;
pub mod logging;
pub mod output;
pub mod testing;

pub use config::{ConfigError, RunnerConfig, TimeoutConfig};
pub use context::{CancelHandle, Context, ContextLogger};
pub use errors::{ContextError, OutputError};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use output::{
    ChannelSink, EntityOutput, ErrorReport, JsonLinesSink, MemorySink, OutputEvent,
    OutputReceiver, OutputSink, TracingSink,
};
