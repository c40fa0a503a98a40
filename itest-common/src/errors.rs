//! Error types shared across the runner crates.

use thiserror::Error;

/// Why a [`Context`](crate::Context) is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Failures reported by an [`OutputSink`](crate::OutputSink).
///
/// These never reach user callbacks; the entity output wrapper logs and
/// drops them.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("output sink is closed")]
    Closed,

    #[error("output receiver disconnected")]
    Disconnected,

    #[error("failed to serialize output event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write output event: {0}")]
    Io(#[from] std::io::Error),
}
