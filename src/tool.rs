//! Invoking registered capabilities as billed steps.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::billing::{sanitize_number, ActionType, BillingEventInput};
use crate::capability::{CapabilityContext, CapabilityOutput, CapabilityRegistry, PARENT_TRACE_HEADER};
use crate::executor::{CostCalculator, CostInputs, StepExecutor, StepOptions, StepOutcome};
use crate::metadata::{self, Metadata};
use crate::Result;

/// Overrides for a single capability invocation. Every field is optional.
#[derive(Clone, Default)]
pub struct ToolInvokeOptions {
    /// Step name. Defaults to `"<capability> tool call"`.
    pub name: Option<String>,
    /// Defaults to [`ActionType::ToolUse`].
    pub action_type: Option<ActionType>,
    /// Defaults to the capability's declared unit cost, then `0`.
    pub unit_cost: Option<f64>,
    /// Initial quantity; the capability may override it.
    pub quantity: Option<f64>,
    /// Initial line-item metadata.
    pub metadata: Metadata,
    /// Computes the total from the reconciled figures.
    pub cost_calculator: Option<CostCalculator>,
    /// Defaults to `true`.
    pub bill_on_error: Option<bool>,
    /// Extra headers for the capability. Recorded on the line item.
    pub headers: BTreeMap<String, String>,
}

impl std::fmt::Debug for ToolInvokeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolInvokeOptions")
            .field("name", &self.name)
            .field("action_type", &self.action_type)
            .field("unit_cost", &self.unit_cost)
            .field("quantity", &self.quantity)
            .field("metadata", &self.metadata)
            .field("cost_calculator", &self.cost_calculator.is_some())
            .field("bill_on_error", &self.bill_on_error)
            .field("headers", &self.headers)
            .finish()
    }
}

impl ToolInvokeOptions {
    /// Options with everything defaulted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the step name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the billed category.
    pub fn with_action_type(mut self, action_type: impl Into<ActionType>) -> Self {
        self.action_type = Some(action_type.into());
        self
    }

    /// Set the unit cost.
    pub fn with_unit_cost(mut self, unit_cost: f64) -> Self {
        self.unit_cost = Some(unit_cost);
        self
    }

    /// Set the quantity.
    pub fn with_quantity(mut self, quantity: f64) -> Self {
        self.quantity = Some(quantity);
        self
    }

    /// Replace the initial metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Compute the total from the reconciled figures.
    pub fn with_cost_calculator<F>(mut self, calculator: F) -> Self
    where
        F: Fn(&CostInputs<'_>) -> f64 + Send + Sync + 'static,
    {
        self.cost_calculator = Some(Arc::new(calculator));
        self
    }

    /// Whether a failed call still records a line item.
    pub fn bill_on_error(mut self, bill: bool) -> Self {
        self.bill_on_error = Some(bill);
        self
    }

    /// Add a header sent to the capability.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Handle for invoking one named capability through a step executor.
///
/// The capability is resolved at every call, so re-registering a name is
/// picked up by existing handles.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use stringcost::{
///     BillingLedger, CapabilityDefinition, CapabilityOutput, CapabilityRegistry, CapabilityTool,
///     Logger, StepExecutor, ToolInvokeOptions,
/// };
///
/// # tokio_test::block_on(async {
/// let registry = Arc::new(CapabilityRegistry::new());
/// registry.register(
///     CapabilityDefinition::from_fn("echo", |input, _ctx| async move {
///         Ok(CapabilityOutput::new(input).with_unit_cost(0.002).with_quantity(1.0))
///     })
///     .with_default_unit_cost(0.001),
/// );
///
/// let ledger = Arc::new(BillingLedger::new());
/// let step = StepExecutor::new("run-1", Arc::clone(&ledger), Logger::new("demo"));
/// let echo = CapabilityTool::new(Arc::clone(&registry), "echo");
///
/// let out = echo.invoke(&step, "hello", ToolInvokeOptions::new()).await.unwrap();
/// assert_eq!(out.result, "hello");
///
/// let item = &ledger.line_items()[0];
/// assert_eq!(item.step_name, "echo tool call");
/// assert_eq!(item.total, 0.002);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct CapabilityTool {
    registry: Arc<CapabilityRegistry>,
    name: String,
}

impl CapabilityTool {
    /// Handle for the capability registered as `name`.
    pub fn new(registry: Arc<CapabilityRegistry>, name: impl Into<String>) -> Self {
        Self {
            registry,
            name: name.into(),
        }
    }

    /// The capability name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the capability as a step.
    ///
    /// Lookup and input serialization happen inside the step, so an
    /// unregistered name or unserializable input fails (and is billed) like
    /// any other step failure.
    pub async fn invoke<I: Serialize>(
        &self,
        step: &StepExecutor,
        input: I,
        options: ToolInvokeOptions,
    ) -> Result<CapabilityOutput> {
        let definition = self.registry.get(&self.name);
        let input = serde_json::to_value(input);

        let declared_cost = definition.as_ref().ok().and_then(|d| d.default_unit_cost);
        let mut step_metadata = options.metadata.clone();
        step_metadata.insert("capability".to_string(), Value::from(self.name.as_str()));

        let calculator = options.cost_calculator.clone();
        let mut step_options = StepOptions::<CapabilityOutput>::new(
            options
                .name
                .clone()
                .unwrap_or_else(|| format!("{} tool call", self.name)),
            options.action_type.clone().unwrap_or(ActionType::ToolUse),
        )
        .with_unit_cost(options.unit_cost.or(declared_cost).unwrap_or(0.0))
        .with_metadata(step_metadata)
        .bill_on_error(options.bill_on_error.unwrap_or(true))
        .with_finalize_billing(move |input| match input.outcome {
            StepOutcome::Success(output) => Some(reconcile(
                input.default_event,
                output,
                input.duration_ms,
                calculator.as_ref(),
            )),
            StepOutcome::Failure(_) => None,
        });
        step_options.quantity = options.quantity;
        step_options.cost_calculator = options.cost_calculator.clone();

        let caller_headers = options.headers;
        step.run(step_options, |runtime| async move {
            let definition = definition?;
            let input = input?;

            let mut headers = caller_headers;
            headers.insert(
                PARENT_TRACE_HEADER.to_string(),
                runtime.parent_trace_id().to_string(),
            );
            let ctx = CapabilityContext {
                trace_id: runtime.trace_id().to_string(),
                parent_trace_id: runtime.parent_trace_id().to_string(),
                logger: runtime.logger().clone(),
                headers: headers.clone(),
            };
            let execution = definition.execute(input, ctx).await?;

            if let Some(quantity) = execution.quantity {
                runtime.set_quantity(quantity);
            }
            if let Some(unit_cost) = execution.unit_cost {
                runtime.set_unit_cost(unit_cost);
            }
            if let Some(fields) = &execution.metadata {
                runtime.record_metadata(fields.clone());
            }
            runtime.record("headers", serde_json::to_value(&headers)?);
            Ok(execution)
        })
        .await
    }

    /// Invoke and deserialize the result payload into `O`.
    pub async fn invoke_as<I, O>(
        &self,
        step: &StepExecutor,
        input: I,
        options: ToolInvokeOptions,
    ) -> Result<O>
    where
        I: Serialize,
        O: serde::de::DeserializeOwned,
    {
        self.invoke(step, input, options).await?.result_as()
    }
}

/// Capability-reported figures win over the step defaults.
fn reconcile(
    default_event: &BillingEventInput,
    output: &CapabilityOutput,
    duration_ms: u64,
    calculator: Option<&CostCalculator>,
) -> BillingEventInput {
    let mut fields = default_event.metadata.clone();
    if let Some(reported) = &output.metadata {
        metadata::merge(&mut fields, reported.clone());
    }
    fields.insert("durationMs".to_string(), Value::from(duration_ms));

    let quantity = sanitize_number(output.quantity, default_event.quantity.unwrap_or(1.0));
    let unit_cost = sanitize_number(output.unit_cost, default_event.unit_cost.unwrap_or(0.0));
    let total = match calculator {
        Some(calculator) => calculator(&CostInputs {
            unit_cost,
            quantity,
            metadata: &fields,
            duration_ms,
        }),
        None => unit_cost * quantity,
    };

    BillingEventInput {
        unit_cost: Some(unit_cost),
        quantity: Some(quantity),
        total: Some(total),
        metadata: fields,
        ..default_event.clone()
    }
}
