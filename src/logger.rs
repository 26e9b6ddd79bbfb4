//! Structured, hierarchical logging.
//!
//! A [`Logger`] carries a prefix and a set of bound context fields. Deriving a
//! child with [`Logger::child`] layers more fields on top without touching the
//! parent, so a step logger automatically tags every record with the agent
//! name, run trace id, step name and step trace id.
//!
//! Records are handed to a [`LogSink`]. The default [`TracingSink`] forwards
//! them to `tracing`; [`MemorySink`] keeps them in memory for inspection.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::metadata::{self, Metadata};

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Lifecycle events such as `run.start` and `step.complete`.
    Info,
    /// Recoverable problems.
    Warn,
    /// Failed steps and runs.
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// One structured log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Unix epoch timestamp in milliseconds when the record was emitted.
    pub timestamp: u128,
    /// Severity.
    pub level: LogLevel,
    /// Prefix of the emitting logger, usually the agent name.
    pub prefix: String,
    /// Event name, e.g. `step.failed`.
    pub message: String,
    /// Bound context merged with call-site fields (call-site wins).
    pub fields: Metadata,
}

impl LogRecord {
    fn new(level: LogLevel, prefix: &str, message: &str, fields: Metadata) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self {
            timestamp,
            level,
            prefix: prefix.to_string(),
            message: message.to_string(),
            fields,
        }
    }
}

/// Destination for log records.
pub trait LogSink: Send + Sync {
    fn emit(&self, record: &LogRecord);
}

/// Forwards every record to `tracing` at the matching level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, record: &LogRecord) {
        let fields = serde_json::Value::Object(record.fields.clone());
        let prefix = record.prefix.as_str();
        let message = record.message.as_str();
        match record.level {
            LogLevel::Debug => tracing::debug!(prefix, fields = %fields, "{message}"),
            LogLevel::Info => tracing::info!(prefix, fields = %fields, "{message}"),
            LogLevel::Warn => tracing::warn!(prefix, fields = %fields, "{message}"),
            LogLevel::Error => tracing::error!(prefix, fields = %fields, "{message}"),
        }
    }
}

/// Keeps records in memory, in emission order.
///
/// Cloning shares the underlying buffer, so a clone handed to a logger and a
/// clone kept by the caller observe the same records.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use stringcost::{metadata, Logger, MemorySink};
///
/// let sink = MemorySink::new();
/// let logger = Logger::with_sink("coffee", Arc::new(sink.clone()))
///     .child(metadata! { "traceId": "abc" });
/// logger.info("run.start", metadata! { "branches": 3 });
///
/// let records = sink.records();
/// assert_eq!(records[0].fields["traceId"], "abc");
/// assert_eq!(records[0].fields["branches"], 3);
/// ```
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemorySink {
    /// An empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record emitted so far.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records whose message equals `message`.
    #[must_use]
    pub fn find(&self, message: &str) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.message == message)
            .collect()
    }

    /// Drop all captured records.
    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl LogSink for MemorySink {
    fn emit(&self, record: &LogRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}

/// A structured logger with a prefix and bound context fields.
#[derive(Clone)]
pub struct Logger {
    prefix: Arc<str>,
    context: Arc<Metadata>,
    sink: Arc<dyn LogSink>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("prefix", &self.prefix)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl Logger {
    /// A logger writing to [`TracingSink`].
    pub fn new(prefix: impl Into<String>) -> Self {
        Self::with_sink(prefix, Arc::new(TracingSink))
    }

    /// A logger writing to the given sink.
    pub fn with_sink(prefix: impl Into<String>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            prefix: Arc::from(prefix.into()),
            context: Arc::new(Metadata::new()),
            sink,
        }
    }

    /// Derive a logger whose context is this logger's context plus `fields`.
    #[must_use]
    pub fn child(&self, fields: Metadata) -> Self {
        Self {
            prefix: Arc::clone(&self.prefix),
            context: Arc::new(metadata::merged(&self.context, &fields)),
            sink: Arc::clone(&self.sink),
        }
    }

    /// Prefix stamped on every record.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The bound context fields.
    pub fn context(&self) -> &Metadata {
        &self.context
    }

    /// Emit a record at `level` with the bound context merged under `fields`.
    pub fn log(&self, level: LogLevel, message: &str, fields: Metadata) {
        let fields = metadata::merged(&self.context, &fields);
        self.sink
            .emit(&LogRecord::new(level, &self.prefix, message, fields));
    }

    /// Emit at [`LogLevel::Debug`].
    pub fn debug(&self, message: &str, fields: Metadata) {
        self.log(LogLevel::Debug, message, fields);
    }

    /// Emit at [`LogLevel::Info`].
    pub fn info(&self, message: &str, fields: Metadata) {
        self.log(LogLevel::Info, message, fields);
    }

    /// Emit at [`LogLevel::Warn`].
    pub fn warn(&self, message: &str, fields: Metadata) {
        self.log(LogLevel::Warn, message, fields);
    }

    /// Emit at [`LogLevel::Error`].
    pub fn error(&self, message: &str, fields: Metadata) {
        self.log(LogLevel::Error, message, fields);
    }
}
