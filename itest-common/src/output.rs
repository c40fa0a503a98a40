//! Output sinks for log lines and structured errors emitted during a run.
//!
//! [`EntityOutput`] is the per-invocation wrapper every entity writes through.
//! It can be closed exactly once; a stage callback that was abandoned at its
//! hard deadline may keep writing afterwards, and those writes are dropped
//! without error and without blocking.

use crate::errors::OutputError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;

/// A structured error record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Full error message, including any subtest or phase prefix.
    pub reason: String,
    /// Source file of the call that reported the error.
    pub file: String,
    /// Source line of the call that reported the error.
    pub line: u32,
    /// Short message, caller location and cause chain.
    pub stack: String,
}

/// One item of entity output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    Log { time: DateTime<Utc>, text: String },
    Error { time: DateTime<Utc>, error: ErrorReport },
}

impl OutputEvent {
    pub fn log(text: impl Into<String>) -> Self {
        Self::Log {
            time: Utc::now(),
            text: text.into(),
        }
    }

    pub fn error(error: ErrorReport) -> Self {
        Self::Error {
            time: Utc::now(),
            error,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Self::Log { time, .. } | Self::Error { time, .. } => *time,
        }
    }
}

/// Destination for entity output. Implementations must be safe to call from
/// several tasks at once, and should not block for long: a stalled `emit`
/// holds up every other writer of the same entity.
pub trait OutputSink: Send + Sync {
    fn emit(&self, event: OutputEvent) -> Result<(), OutputError>;
}

/// Closable, concurrency-safe view of an [`OutputSink`] owned by one entity
/// invocation.
///
/// Writes are serialized. Closing never waits for them: a write that has
/// already entered the sink may still finish after `close` returns, but no
/// write starts afterwards.
pub struct EntityOutput {
    sink: Arc<dyn OutputSink>,
    closed: AtomicBool,
    write_lock: Mutex<()>,
}

impl EntityOutput {
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            sink,
            closed: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    /// Forward a log line. Dropped silently once closed.
    pub fn log(&self, text: &str) {
        self.emit(OutputEvent::log(text));
    }

    /// Forward an error record. Dropped silently once closed.
    pub fn error(&self, error: ErrorReport) {
        self.emit(OutputEvent::error(error));
    }

    fn emit(&self, event: OutputEvent) {
        // Checked before the lock so late writers never queue behind a
        // stalled sink, and again after it for writers that were queued.
        if self.is_closed() {
            return;
        }
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() {
            return;
        }
        if let Err(err) = self.sink.emit(event) {
            warn!(error = %err, "Dropping entity output");
        }
    }

    /// Close the output. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Sink backed by an unbounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<OutputEvent>,
}

/// Receiving half of a [`ChannelSink`].
pub struct OutputReceiver {
    receiver: mpsc::UnboundedReceiver<OutputEvent>,
}

impl ChannelSink {
    pub fn channel() -> (ChannelSink, OutputReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ChannelSink { sender }, OutputReceiver { receiver })
    }
}

impl OutputSink for ChannelSink {
    fn emit(&self, event: OutputEvent) -> Result<(), OutputError> {
        self.sender
            .send(event)
            .map_err(|_| OutputError::Disconnected)
    }
}

impl OutputReceiver {
    /// Wait for the next event. Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<OutputEvent> {
        self.receiver.recv().await
    }

    /// Take every event that is already queued without waiting.
    pub fn drain(&mut self) -> Vec<OutputEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Sink that keeps every event in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<OutputEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OutputEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Text of every log event, in order.
    pub fn logs(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                OutputEvent::Log { text, .. } => Some(text),
                OutputEvent::Error { .. } => None,
            })
            .collect()
    }

    /// Every error record, in order.
    pub fn errors(&self) -> Vec<ErrorReport> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                OutputEvent::Error { error, .. } => Some(error),
                OutputEvent::Log { .. } => None,
            })
            .collect()
    }
}

impl OutputSink for MemorySink {
    fn emit(&self, event: OutputEvent) -> Result<(), OutputError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        Ok(())
    }
}

/// Sink that writes one JSON document per line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl<W: Write + Send> OutputSink for JsonLinesSink<W> {
    fn emit(&self, event: OutputEvent) -> Result<(), OutputError> {
        let line = serde_json::to_string(&event)?;
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

/// Sink that forwards events to `tracing`, tagged with an entity name.
pub struct TracingSink {
    entity: String,
}

impl TracingSink {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
        }
    }
}

impl OutputSink for TracingSink {
    fn emit(&self, event: OutputEvent) -> Result<(), OutputError> {
        match event {
            OutputEvent::Log { text, .. } => {
                tracing::info!(entity = %self.entity, "{}", text);
            }
            OutputEvent::Error { error, .. } => {
                tracing::error!(
                    entity = %self.entity,
                    file = %error.file,
                    line = error.line,
                    "{}",
                    error.reason
                );
            }
        }
        Ok(())
    }
}
