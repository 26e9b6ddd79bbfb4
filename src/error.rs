//! Error types for step execution and agent runs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::billing::Invoice;

/// The main error type for step, capability and workflow operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A capability was looked up by a name nobody registered.
    #[error("capability \"{name}\" is not registered")]
    CapabilityNotFound {
        /// The name that was requested.
        name: String,
    },

    /// A validation error occurred.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An error occurred during execution.
    #[error("Execution error: {0}")]
    Execution(String),

    /// A JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A generic error with a message.
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// A short, stable tag naming the variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Error::CapabilityNotFound { .. } => "CapabilityNotFound",
            Error::Validation(_) => "Validation",
            Error::Execution(_) => "Execution",
            Error::Json(_) => "Json",
            Error::Message(_) => "Error",
        }
    }

    /// Kind and message only. This is all that ever reaches logs or line-item metadata.
    #[must_use]
    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Message(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Message(msg.to_string())
    }
}

/// Serialized view of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    /// Variant tag, see [`Error::kind`].
    pub kind: String,
    /// Rendered error message.
    pub message: String,
}

/// A failure that escaped an agent's workflow.
///
/// Always carries the invoice as it stood when the run aborted, so line items
/// billed before the failure (including the failing step itself, when it was
/// billed on error) are never lost.
#[derive(Error, Debug)]
#[error("agent \"{agent_name}\" failed (trace {trace_id})")]
pub struct AgentExecutionError {
    /// Name of the agent whose workflow failed.
    pub agent_name: String,
    /// Root trace id of the failed run.
    pub trace_id: String,
    /// Partial invoice generated before the failure.
    pub invoice: Invoice,
    /// The error raised by the workflow.
    #[source]
    pub source: Error,
}

impl AgentExecutionError {
    /// The error originally raised inside the workflow.
    pub fn original_error(&self) -> &Error {
        &self.source
    }

    /// Consume the wrapper, returning the original error.
    pub fn into_original_error(self) -> Error {
        self.source
    }
}

/// A specialized `Result` type for step and workflow operations.
pub type Result<T> = std::result::Result<T, Error>;
