//! # stringcost
//!
//! Step-level tracing, structured logging and per-run invoicing for async
//! agent workflows.
//!
//! Wrap each unit of work in a step and the crate takes care of the
//! bookkeeping: every step gets a child trace id, start/complete/failed log
//! records, and exactly one line item in the run's invoice, whether it
//! succeeds or fails.
//!
//! ## Core Concepts
//!
//! - **Agent**: A named workflow; each invocation gets a fresh ledger, logger and trace id
//! - **AgentWorkflow**: The trait domain logic implements (or [`LambdaWorkflow`] for closures)
//! - **StepExecutor**: Runs one unit of work as a traced, logged, billed step
//! - **StepRuntime**: Handle inside a step for adjusting quantity, unit cost and metadata
//! - **BillingLedger / Invoice**: Append-only line items and their rounded total
//! - **CapabilityRegistry**: Name-keyed directory of external capabilities (tools)
//! - **CapabilityTool**: Invokes a registered capability through the step machinery
//! - **Logger**: Hierarchical structured logger backed by `tracing`
//!
//! ## Example: Billed Workflow
//!
//! ```rust
//! use stringcost::{metadata, ActionType, Agent, InvokeOptions, LambdaWorkflow, StepOptions};
//!
//! # tokio_test::block_on(async {
//! let agent = Agent::new(
//!     "namer",
//!     LambdaWorkflow::new(|step, prompt: String, _ctx| async move {
//!         let themes = step
//!             .run(
//!                 StepOptions::new("Generate Themes", ActionType::LlmCall).with_unit_cost(0.002),
//!                 |runtime| async move {
//!                     let themes = vec![format!("{prompt} Lab"), format!("{prompt} House")];
//!                     runtime.set_quantity(themes.len() as f64);
//!                     runtime.record_metadata(metadata! { "promptTokens": 4 });
//!                     Ok(themes)
//!                 },
//!             )
//!             .await?;
//!
//!         for theme in &themes {
//!             step.run(
//!                 StepOptions::<()>::new(format!("Evaluate {theme}"), ActionType::Evaluation)
//!                     .with_unit_cost(0.001),
//!                 |_| async { Ok(()) },
//!             )
//!             .await?;
//!         }
//!         Ok(themes)
//!     }),
//! );
//!
//! let run = agent.invoke("Solar".to_string(), InvokeOptions::new()).await.unwrap();
//! assert_eq!(run.output, vec!["Solar Lab", "Solar House"]);
//! assert_eq!(run.invoice.line_items.len(), 3);
//! assert_eq!(run.invoice.total, 0.006); // 0.002 * 2 + 0.001 * 2
//! # });
//! ```

pub mod error;
pub mod metadata;
pub mod trace;
pub mod logger;
pub mod billing;
pub mod config;
pub mod context;
pub mod executor;
pub mod workflow;
pub mod agent;
pub mod capability;
pub mod tool;
pub mod mock;

pub use error::{AgentExecutionError, Error, ErrorSummary, Result};
pub use metadata::Metadata;
pub use logger::{LogLevel, LogRecord, LogSink, Logger, MemorySink, TracingSink};
pub use billing::{ActionType, BillingEvent, BillingEventInput, BillingLedger, BillingStatus, Invoice};
pub use config::RuntimeConfig;
pub use context::{AgentContext, InvokeOptions};
pub use executor::{
    CostCalculator, CostInputs, FinalizeHook, FinalizeInput, StepExecutor, StepOptions,
    StepOutcome, StepRuntime,
};
pub use workflow::{AgentWorkflow, LambdaWorkflow};
pub use agent::{Agent, AgentRunResult};
pub use capability::{
    Capability, CapabilityContext, CapabilityDefinition, CapabilityOutput, CapabilityRegistry,
    PARENT_TRACE_HEADER,
};
pub use tool::{CapabilityTool, ToolInvokeOptions};

#[doc(hidden)]
pub mod __private {
    pub use serde_json::json;
}
