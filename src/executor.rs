//! The step executor: tracing, timing, logging and billing around one unit of work.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde_json::Value;

use crate::billing::{sanitize_number, ActionType, BillingEventInput, BillingLedger, BillingStatus};
use crate::logger::Logger;
use crate::metadata::Metadata;
use crate::trace::{derive_child_id, now_millis};
use crate::{metadata, Error, Result};

/// Computes a line-item total from the step's final billing figures.
pub type CostCalculator = Arc<dyn Fn(&CostInputs<'_>) -> f64 + Send + Sync>;

/// Replaces the default billing event of a step. Returning `None` keeps the default.
pub type FinalizeHook<T> =
    Arc<dyn Fn(FinalizeInput<'_, T>) -> Option<BillingEventInput> + Send + Sync>;

/// Figures handed to a [`CostCalculator`].
#[derive(Debug, Clone, Copy)]
pub struct CostInputs<'a> {
    /// Unit cost after runtime adjustments.
    pub unit_cost: f64,
    /// Quantity after runtime adjustments.
    pub quantity: f64,
    /// Line-item metadata as recorded so far.
    pub metadata: &'a Metadata,
    /// Wall-clock duration of the work.
    pub duration_ms: u64,
}

/// How the work of a step ended.
#[derive(Debug, Clone, Copy)]
pub enum StepOutcome<'a, T> {
    /// The work returned a value.
    Success(&'a T),
    /// The work failed with this error.
    Failure(&'a Error),
}

impl<'a, T> StepOutcome<'a, T> {
    /// The returned value, if the work succeeded.
    pub fn value(&self) -> Option<&'a T> {
        match self {
            Self::Success(value) => Some(value),
            Self::Failure(_) => None,
        }
    }

    /// The error, if the work failed.
    pub fn error(&self) -> Option<&'a Error> {
        match self {
            Self::Success(_) => None,
            Self::Failure(error) => Some(error),
        }
    }

    /// Billing status matching this outcome.
    pub fn status(&self) -> BillingStatus {
        match self {
            Self::Success(_) => BillingStatus::Success,
            Self::Failure(_) => BillingStatus::Error,
        }
    }
}

/// Input of a [`FinalizeHook`].
pub struct FinalizeInput<'a, T> {
    /// Result of the work.
    pub outcome: StepOutcome<'a, T>,
    /// Wall-clock duration of the work.
    pub duration_ms: u64,
    /// The event that is recorded if the hook returns `None`.
    pub default_event: &'a BillingEventInput,
}

/// Options of one step.
///
/// # Example
///
/// ```rust
/// use stringcost::{metadata, ActionType, StepOptions};
///
/// let options = StepOptions::<()>::new("Evaluate Theme", ActionType::Evaluation)
///     .with_unit_cost(0.001)
///     .with_metadata(metadata! { "theme": "Solar Lab" })
///     .with_cost_calculator(|inputs| inputs.unit_cost);
/// assert!(options.bill_on_error);
/// ```
pub struct StepOptions<T> {
    /// Step name, used in logs, the child trace id and the line item.
    pub name: String,
    /// Category billed for.
    pub action_type: ActionType,
    /// Initial unit cost; defaults to `0`.
    pub unit_cost: Option<f64>,
    /// Initial quantity; defaults to `1`.
    pub quantity: Option<f64>,
    /// Initial line-item metadata.
    pub metadata: Metadata,
    /// Replaces `unit_cost * quantity` as the total.
    pub cost_calculator: Option<CostCalculator>,
    /// Last word on the recorded event.
    pub finalize_billing: Option<FinalizeHook<T>>,
    /// Record a line item when the work fails. Defaults to `true`.
    pub bill_on_error: bool,
}

impl<T> Clone for StepOptions<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            action_type: self.action_type.clone(),
            unit_cost: self.unit_cost,
            quantity: self.quantity,
            metadata: self.metadata.clone(),
            cost_calculator: self.cost_calculator.clone(),
            finalize_billing: self.finalize_billing.clone(),
            bill_on_error: self.bill_on_error,
        }
    }
}

impl<T> fmt::Debug for StepOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepOptions")
            .field("name", &self.name)
            .field("action_type", &self.action_type)
            .field("unit_cost", &self.unit_cost)
            .field("quantity", &self.quantity)
            .field("metadata", &self.metadata)
            .field("cost_calculator", &self.cost_calculator.is_some())
            .field("finalize_billing", &self.finalize_billing.is_some())
            .field("bill_on_error", &self.bill_on_error)
            .finish()
    }
}

impl<T> StepOptions<T> {
    /// Options with no costs set and billing on error enabled.
    pub fn new(name: impl Into<String>, action_type: impl Into<ActionType>) -> Self {
        Self {
            name: name.into(),
            action_type: action_type.into(),
            unit_cost: None,
            quantity: None,
            metadata: Metadata::new(),
            cost_calculator: None,
            finalize_billing: None,
            bill_on_error: true,
        }
    }

    /// Set the initial unit cost.
    pub fn with_unit_cost(mut self, unit_cost: f64) -> Self {
        self.unit_cost = Some(unit_cost);
        self
    }

    /// Set the initial quantity.
    pub fn with_quantity(mut self, quantity: f64) -> Self {
        self.quantity = Some(quantity);
        self
    }

    /// Replace the initial metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Compute the total from the final figures.
    pub fn with_cost_calculator<F>(mut self, calculator: F) -> Self
    where
        F: Fn(&CostInputs<'_>) -> f64 + Send + Sync + 'static,
    {
        self.cost_calculator = Some(Arc::new(calculator));
        self
    }

    /// Inspect or replace the default event before it is recorded.
    pub fn with_finalize_billing<F>(mut self, hook: F) -> Self
    where
        F: Fn(FinalizeInput<'_, T>) -> Option<BillingEventInput> + Send + Sync + 'static,
    {
        self.finalize_billing = Some(Arc::new(hook));
        self
    }

    /// Whether a failed step still records a line item.
    pub fn bill_on_error(mut self, bill: bool) -> Self {
        self.bill_on_error = bill;
        self
    }
}

#[derive(Debug, Clone)]
struct BillingDraft {
    unit_cost: f64,
    quantity: f64,
    metadata: Metadata,
}

/// Handle given to the body of a running step.
///
/// Changes made through it are reflected in the step's line item, and are
/// visible to its finalize hook.
#[derive(Debug)]
pub struct StepRuntime {
    trace_id: String,
    parent_trace_id: String,
    logger: Logger,
    draft: Arc<Mutex<BillingDraft>>,
}

impl StepRuntime {
    /// Trace id of this step.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Trace id of the run this step belongs to.
    pub fn parent_trace_id(&self) -> &str {
        &self.parent_trace_id
    }

    /// Logger bound with the step name and trace id.
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Set the billed quantity. Non-finite values are ignored.
    pub fn set_quantity(&self, quantity: f64) {
        let mut draft = self.draft();
        draft.quantity = sanitize_number(Some(quantity), draft.quantity);
    }

    /// Set the billed unit cost. Non-finite values are ignored.
    pub fn set_unit_cost(&self, unit_cost: f64) {
        let mut draft = self.draft();
        draft.unit_cost = sanitize_number(Some(unit_cost), draft.unit_cost);
    }

    /// Merge fields into the line-item metadata.
    pub fn record_metadata(&self, fields: Metadata) {
        metadata::merge(&mut self.draft().metadata, fields);
    }

    /// Set a single metadata field.
    pub fn record(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.draft().metadata.insert(key.into(), value.into());
    }

    /// Current quantity.
    pub fn quantity(&self) -> f64 {
        self.draft().quantity
    }

    /// Current unit cost.
    pub fn unit_cost(&self) -> f64 {
        self.draft().unit_cost
    }

    /// Copy of the metadata recorded so far.
    pub fn metadata(&self) -> Metadata {
        self.draft().metadata.clone()
    }

    fn draft(&self) -> MutexGuard<'_, BillingDraft> {
        self.draft.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs steps for one agent run, billing each into the run's ledger.
///
/// Cloning is cheap; clones share the ledger and root trace id.
///
/// Line items are appended when a step *finishes*. Steps awaited one after
/// another therefore appear in the order they were issued, while steps running
/// concurrently appear in the order they completed.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use stringcost::{ActionType, BillingLedger, Logger, StepExecutor, StepOptions};
///
/// # tokio_test::block_on(async {
/// let ledger = Arc::new(BillingLedger::new());
/// let step = StepExecutor::new("run-1", Arc::clone(&ledger), Logger::new("demo"));
///
/// let themes = step
///     .run(
///         StepOptions::new("Generate Themes", ActionType::LlmCall).with_unit_cost(0.002),
///         |runtime| async move {
///             runtime.set_quantity(3.0);
///             Ok(vec!["Solar Lab", "Velvet Vault", "Nimbus House"])
///         },
///     )
///     .await
///     .unwrap();
///
/// assert_eq!(themes.len(), 3);
/// assert_eq!(ledger.invoice().total, 0.006);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct StepExecutor {
    root_trace_id: Arc<str>,
    ledger: Arc<BillingLedger>,
    logger: Logger,
}

impl StepExecutor {
    /// Executor billing into `ledger` under `root_trace_id`.
    pub fn new(root_trace_id: impl Into<String>, ledger: Arc<BillingLedger>, logger: Logger) -> Self {
        Self {
            root_trace_id: Arc::from(root_trace_id.into()),
            ledger,
            logger,
        }
    }

    /// Trace id every step id derives from.
    pub fn root_trace_id(&self) -> &str {
        &self.root_trace_id
    }

    /// The ledger steps are billed into.
    pub fn ledger(&self) -> &Arc<BillingLedger> {
        &self.ledger
    }

    /// Run `work` as a traced, logged and billed step.
    ///
    /// On success the work's value is returned after its line item is
    /// recorded. On failure a line item with status `error` is recorded
    /// (unless `bill_on_error` is off) and the original error is returned.
    pub async fn run<T, F, Fut>(&self, options: StepOptions<T>, work: F) -> Result<T>
    where
        F: FnOnce(StepRuntime) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let trace_id = derive_child_id(&self.root_trace_id, &options.name, now_millis());
        let logger = self
            .logger
            .child(metadata! { "step": options.name.as_str(), "traceId": trace_id.as_str() });

        let mut initial = options.metadata.clone();
        initial.insert("traceId".to_string(), Value::from(trace_id.as_str()));
        let draft = Arc::new(Mutex::new(BillingDraft {
            unit_cost: sanitize_number(options.unit_cost, 0.0),
            quantity: sanitize_number(options.quantity, 1.0),
            metadata: initial,
        }));

        {
            let draft = draft.lock().unwrap_or_else(PoisonError::into_inner);
            logger.info(
                "start",
                metadata! {
                    "actionType": options.action_type.as_str(),
                    "unitCost": draft.unit_cost,
                    "quantity": draft.quantity,
                },
            );
        }

        let runtime = StepRuntime {
            trace_id,
            parent_trace_id: self.root_trace_id.to_string(),
            logger: logger.clone(),
            draft: Arc::clone(&draft),
        };
        let outcome = work(runtime).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut draft = draft.lock().unwrap_or_else(PoisonError::into_inner).clone();
        draft
            .metadata
            .insert("durationMs".to_string(), Value::from(duration_ms));

        match outcome {
            Ok(value) => {
                let default_event =
                    build_event(&options, &draft, duration_ms, BillingStatus::Success);
                let event = finalize(&options, StepOutcome::Success(&value), duration_ms, default_event);
                let recorded = self.ledger.record(event);
                logger.info(
                    "complete",
                    metadata! { "durationMs": duration_ms, "total": recorded.total },
                );
                Ok(value)
            }
            Err(error) => {
                let summary = serde_json::to_value(error.summary()).unwrap_or(Value::Null);
                draft.metadata.insert("error".to_string(), summary.clone());
                logger.error(
                    "failed",
                    metadata! { "durationMs": duration_ms, "error": summary },
                );

                if options.bill_on_error {
                    let default_event =
                        build_event(&options, &draft, duration_ms, BillingStatus::Error);
                    let event =
                        finalize(&options, StepOutcome::Failure(&error), duration_ms, default_event);
                    self.ledger.record(event);
                }
                Err(error)
            }
        }
    }
}

fn build_event<T>(
    options: &StepOptions<T>,
    draft: &BillingDraft,
    duration_ms: u64,
    status: BillingStatus,
) -> BillingEventInput {
    let total = match &options.cost_calculator {
        Some(calculator) => calculator(&CostInputs {
            unit_cost: draft.unit_cost,
            quantity: draft.quantity,
            metadata: &draft.metadata,
            duration_ms,
        }),
        None => draft.unit_cost * draft.quantity,
    };
    BillingEventInput {
        step_name: options.name.clone(),
        action_type: options.action_type.clone(),
        unit_cost: Some(draft.unit_cost),
        quantity: Some(draft.quantity),
        total: Some(total),
        metadata: draft.metadata.clone(),
        status,
    }
}

fn finalize<T>(
    options: &StepOptions<T>,
    outcome: StepOutcome<'_, T>,
    duration_ms: u64,
    default_event: BillingEventInput,
) -> BillingEventInput {
    let replacement = options.finalize_billing.as_ref().and_then(|hook| {
        hook(FinalizeInput {
            outcome,
            duration_ms,
            default_event: &default_event,
        })
    });
    replacement.unwrap_or(default_event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::MemorySink;
    use serde_json::json;
    use std::time::Duration;

    fn executor() -> (StepExecutor, Arc<BillingLedger>, MemorySink) {
        let ledger = Arc::new(BillingLedger::new());
        let sink = MemorySink::new();
        let logger = Logger::with_sink("test", Arc::new(sink.clone()));
        (StepExecutor::new("root", Arc::clone(&ledger), logger), ledger, sink)
    }

    #[tokio::test]
    async fn success_bills_once_and_returns_value() {
        let (step, ledger, sink) = executor();
        let out = step
            .run(
                StepOptions::new("Double", ActionType::LlmCall)
                    .with_unit_cost(0.5)
                    .with_quantity(2.0),
                |_| async { Ok(21 * 2) },
            )
            .await
            .unwrap();
        assert_eq!(out, 42);

        let items = ledger.line_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].total, 1.0);
        assert_eq!(items[0].status, BillingStatus::Success);
        assert!(items[0].metadata["traceId"].as_str().unwrap().starts_with("root:double:"));
        assert!(items[0].metadata.contains_key("durationMs"));

        let messages: Vec<_> = sink.records().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["start", "complete"]);
        let start = &sink.find("start")[0];
        assert_eq!(start.fields["actionType"], json!("llm_call"));
        assert_eq!(start.fields["step"], json!("Double"));
    }

    #[tokio::test]
    async fn runtime_mutations_reach_the_line_item() {
        let (step, ledger, _) = executor();
        step.run(
            StepOptions::<()>::new("Generate", ActionType::LlmCall).with_unit_cost(0.002),
            |runtime| async move {
                assert_eq!(runtime.parent_trace_id(), "root");
                assert!(runtime.trace_id().starts_with("root:generate:"));
                runtime.set_quantity(3.0);
                runtime.set_quantity(f64::NAN);
                runtime.record_metadata(metadata! { "promptTokens": 12 });
                runtime.record("completionTokens", 9);
                Ok(())
            },
        )
        .await
        .unwrap();

        let item = &ledger.line_items()[0];
        assert_eq!(item.quantity, 3.0);
        assert!((item.total - 0.006).abs() < 1e-12);
        assert_eq!(item.metadata["promptTokens"], json!(12));
        assert_eq!(item.metadata["completionTokens"], json!(9));
    }

    #[tokio::test]
    async fn cost_calculator_overrides_product() {
        let (step, ledger, _) = executor();
        step.run(
            StepOptions::<()>::new("Evaluate", ActionType::Evaluation)
                .with_unit_cost(0.001)
                .with_quantity(4.0)
                .with_cost_calculator(|inputs| {
                    assert!(inputs.metadata.contains_key("durationMs"));
                    inputs.unit_cost
                }),
            |_| async { Ok(()) },
        )
        .await
        .unwrap();
        assert_eq!(ledger.line_items()[0].total, 0.001);
    }

    #[tokio::test]
    async fn failure_bills_error_item_and_returns_original_error() {
        let (step, ledger, sink) = executor();
        let err = step
            .run(
                StepOptions::<()>::new("Explode", ActionType::Validation).with_unit_cost(0.1),
                |runtime| async move {
                    runtime.record("attempt", 1);
                    Err(Error::Validation("boom".into()))
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m == "boom"));

        let items = ledger.line_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, BillingStatus::Error);
        assert_eq!(items[0].total, 0.1);
        assert_eq!(items[0].metadata["attempt"], json!(1));
        assert_eq!(
            items[0].metadata["error"],
            json!({ "kind": "Validation", "message": "Validation error: boom" })
        );

        let failed = &sink.find("failed")[0];
        assert_eq!(failed.level, crate::logger::LogLevel::Error);
        assert_eq!(failed.fields["error"]["kind"], json!("Validation"));
    }

    #[tokio::test]
    async fn failure_without_bill_on_error_records_nothing() {
        let (step, ledger, _) = executor();
        let result = step
            .run(
                StepOptions::<()>::new("Explode", ActionType::Validation).bill_on_error(false),
                |_| async { Err(Error::from("boom")) },
            )
            .await;
        assert!(result.is_err());
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn finalize_hook_replaces_default_event_wholesale() {
        let (step, ledger, _) = executor();
        step.run(
            StepOptions::<u32>::new("Tool", ActionType::ToolUse)
                .with_unit_cost(0.01)
                .with_quantity(5.0)
                .with_finalize_billing(|input| {
                    assert_eq!(input.outcome.value(), Some(&7));
                    assert_eq!(input.default_event.metadata["seen"], json!(true));
                    Some(
                        BillingEventInput::new("Tool (reconciled)", ActionType::ToolUse)
                            .with_unit_cost(0.002)
                            .with_quantity(1.0),
                    )
                }),
            |runtime| async move {
                runtime.record("seen", true);
                Ok(7u32)
            },
        )
        .await
        .unwrap();

        let item = &ledger.line_items()[0];
        assert_eq!(item.step_name, "Tool (reconciled)");
        assert_eq!(item.total, 0.002);
        // Wholesale replacement: nothing from the default event survives.
        assert!(item.metadata.is_empty());
    }

    #[tokio::test]
    async fn finalize_hook_returning_none_keeps_default() {
        let (step, ledger, _) = executor();
        step.run(
            StepOptions::<()>::new("Keep", ActionType::Synthesis)
                .with_unit_cost(0.003)
                .with_finalize_billing(|_| None),
            |_| async { Ok(()) },
        )
        .await
        .unwrap();
        let items = ledger.line_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].total, 0.003);
        assert_eq!(items[0].step_name, "Keep");
    }

    #[tokio::test]
    async fn finalize_hook_sees_error_on_failure() {
        let (step, ledger, _) = executor();
        let _ = step
            .run(
                StepOptions::<()>::new("Explode", ActionType::Validation)
                    .with_unit_cost(0.1)
                    .with_finalize_billing(|input| {
                        let error = input.outcome.error()?;
                        Some(BillingEventInput {
                            total: Some(0.0),
                            metadata: metadata! { "waived": error.kind() },
                            ..input.default_event.clone()
                        })
                    }),
                |_| async { Err(Error::Execution("down".into())) },
            )
            .await;
        let item = &ledger.line_items()[0];
        assert_eq!(item.status, BillingStatus::Error);
        assert_eq!(item.total, 0.0);
        assert_eq!(item.metadata["waived"], json!("Execution"));
    }

    #[tokio::test]
    async fn concurrent_steps_commit_in_completion_order() {
        let (step, ledger, _) = executor();
        let slow = step.run(
            StepOptions::<()>::new("slow", ActionType::Evaluation),
            |_| async {
                tokio::time::sleep(Duration::from_millis(40)).await;
                Ok(())
            },
        );
        let fast = step.run(
            StepOptions::<()>::new("fast", ActionType::Evaluation),
            |_| async { Ok(()) },
        );
        let (a, b) = tokio::join!(slow, fast);
        a.unwrap();
        b.unwrap();

        let names: Vec<_> = ledger.line_items().into_iter().map(|i| i.step_name).collect();
        assert_eq!(names, vec!["fast", "slow"]);
    }

    #[tokio::test]
    async fn sequential_steps_commit_in_issue_order() {
        let (step, ledger, _) = executor();
        for name in ["one", "two", "three"] {
            step.run(StepOptions::<()>::new(name, ActionType::LlmCall), |_| async { Ok(()) })
                .await
                .unwrap();
        }
        let names: Vec<_> = ledger.line_items().into_iter().map(|i| i.step_name).collect();
        assert_eq!(names, vec!["one", "two", "three"]);
    }
}
