//! Per-run context handed to workflows, and the options a run is invoked with.

use std::sync::Arc;

use crate::billing::BillingLedger;
use crate::logger::Logger;
use crate::metadata::Metadata;

/// Context passed to a workflow for the duration of one run.
///
/// Everything here is owned by that single run: the ledger is created fresh
/// for each invocation and is never shared with another run.
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Root trace id of the run.
    pub trace_id: String,
    /// The run's billing ledger.
    pub ledger: Arc<BillingLedger>,
    /// Logger bound with the agent name and trace id.
    pub logger: Logger,
    /// Caller-supplied metadata.
    pub metadata: Metadata,
}

/// Options for a single [`Agent::invoke`](crate::Agent::invoke) call.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Reuse an existing trace id instead of generating one, e.g. one received
    /// from an upstream caller.
    pub trace_id: Option<String>,
    /// Fields attached to the run context.
    pub metadata: Metadata,
    /// Logger to derive the run logger from. Defaults to the agent's logger.
    pub logger: Option<Logger>,
}

impl InvokeOptions {
    /// Options with everything defaulted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `trace_id` as the run trace id.
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Attach metadata to the run context.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Derive the run logger from `logger`.
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }
}
