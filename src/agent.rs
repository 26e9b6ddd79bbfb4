//! Agents: named workflows run with a fresh ledger, logger and trace per call.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::billing::{BillingLedger, Invoice};
use crate::config::RuntimeConfig;
use crate::error::AgentExecutionError;
use crate::logger::Logger;
use crate::trace::new_root_id;
use crate::workflow::AgentWorkflow;
use crate::{metadata, AgentContext, InvokeOptions, StepExecutor};

/// Result of a successful run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunResult<O> {
    /// Value returned by the workflow.
    pub output: O,
    /// Every line item billed during the run.
    pub invoice: Invoice,
    /// Root trace id of the run.
    pub trace_id: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration of the run.
    pub duration_ms: u64,
}

/// A named workflow.
///
/// Each [`invoke`](Agent::invoke) builds its own ledger, logger and root trace
/// id, so concurrent invocations never share billing state.
///
/// # Example
///
/// ```rust
/// use stringcost::{ActionType, Agent, InvokeOptions, LambdaWorkflow, StepOptions};
///
/// # tokio_test::block_on(async {
/// let agent = Agent::new(
///     "double",
///     LambdaWorkflow::new(|step, x: i32, _ctx| async move {
///         step.run(
///             StepOptions::new("Double", ActionType::LlmCall).with_unit_cost(0.002),
///             |_| async move { Ok(x * 2) },
///         )
///         .await
///     }),
/// );
///
/// let run = agent.invoke(5, InvokeOptions::new()).await.unwrap();
/// assert_eq!(run.output, 10);
/// assert_eq!(run.invoice.line_items.len(), 1);
/// assert_eq!(run.invoice.total, 0.002);
/// # });
/// ```
pub struct Agent<W> {
    name: String,
    workflow: W,
    config: RuntimeConfig,
    logger: Option<Logger>,
}

impl<W: AgentWorkflow> Agent<W> {
    /// Wrap a workflow under an agent name.
    pub fn new(name: impl Into<String>, workflow: W) -> Self {
        Self {
            name: name.into(),
            workflow,
            config: RuntimeConfig::default(),
            logger: None,
        }
    }

    /// Replace the runtime configuration.
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Base logger for every run. Defaults to a `tracing` logger prefixed with the agent name.
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// The agent name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The wrapped workflow.
    pub fn workflow(&self) -> &W {
        &self.workflow
    }

    /// Run the workflow once.
    ///
    /// On failure the returned [`AgentExecutionError`] carries the invoice of
    /// everything billed before the workflow gave up.
    pub async fn invoke(
        &self,
        input: W::Input,
        options: InvokeOptions,
    ) -> Result<AgentRunResult<W::Output>, AgentExecutionError> {
        let trace_id = options.trace_id.unwrap_or_else(new_root_id);
        let base = options
            .logger
            .or_else(|| self.logger.clone())
            .unwrap_or_else(|| Logger::new(self.name.as_str()));
        let logger = base.child(metadata! {
            "traceId": trace_id.as_str(),
            "agent": self.name.as_str(),
        });
        let ledger = Arc::new(BillingLedger::with_currency(self.config.currency.as_str()));
        let started_at = Utc::now();
        let started = Instant::now();

        let preview = serde_json::to_value(&input)
            .map(|value| summarize_input(&value, self.config.input_preview_chars))
            .unwrap_or_else(|_| Value::from("<unserializable>"));
        logger.info("run.start", metadata! { "inputPreview": preview });

        let step = StepExecutor::new(trace_id.as_str(), Arc::clone(&ledger), logger.clone());
        let ctx = AgentContext {
            trace_id: trace_id.clone(),
            ledger: Arc::clone(&ledger),
            logger: logger.clone(),
            metadata: options.metadata,
        };

        let result = self.workflow.run(&step, input, &ctx).await;
        let invoice = ledger.invoice();
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(output) => {
                logger.info(
                    "run.success",
                    metadata! { "durationMs": duration_ms, "total": invoice.total },
                );
                Ok(AgentRunResult {
                    output,
                    invoice,
                    trace_id,
                    started_at,
                    duration_ms,
                })
            }
            Err(error) => {
                logger.error(
                    "run.error",
                    metadata! {
                        "durationMs": duration_ms,
                        "error": serde_json::to_value(error.summary()).unwrap_or(Value::Null),
                    },
                );
                Err(AgentExecutionError {
                    agent_name: self.name.clone(),
                    trace_id,
                    invoice,
                    source: error,
                })
            }
        }
    }
}

/// Bounded preview of a run input for logging.
///
/// Strings longer than `max_chars` are cut with a trailing `...`; arrays and
/// objects are reduced to their shape (`Array(3)`, `Object(prompt,branches)`).
#[must_use]
pub fn summarize_input(input: &Value, max_chars: usize) -> Value {
    const MAX_KEYS: usize = 5;
    match input {
        Value::String(s) if s.chars().count() > max_chars => {
            let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
            Value::from(format!("{kept}..."))
        }
        Value::Array(items) => Value::from(format!("Array({})", items.len())),
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().take(MAX_KEYS).map(String::as_str).collect();
            let more = if map.len() > MAX_KEYS { ",…" } else { "" };
            Value::from(format!("Object({}{more})", keys.join(",")))
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::BillingStatus;
    use crate::logger::MemorySink;
    use crate::mock::{evaluate_theme, generate_themes, synthesize_names, MARKET_TRENDS};
    use crate::{
        ActionType, CapabilityDefinition, CapabilityOutput, CapabilityRegistry, CapabilityTool,
        Error, LambdaWorkflow, StepOptions, ToolInvokeOptions, PARENT_TRACE_HEADER,
    };
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct NamingInput {
        prompt: String,
        branches: usize,
    }

    fn naming_agent() -> Agent<impl AgentWorkflow<Input = NamingInput, Output = Vec<String>>> {
        Agent::new(
            "coffee",
            LambdaWorkflow::new(|step: StepExecutor, input: NamingInput, _ctx| async move {
                let NamingInput { prompt, branches } = input;
                let generation = step
                    .run(
                        StepOptions::new("Generate Name Themes", ActionType::LlmCall)
                            .with_unit_cost(0.002),
                        |_| {
                            let prompt = prompt.clone();
                            async move { Ok(generate_themes(&prompt, branches)) }
                        },
                    )
                    .await?;

                for theme in &generation.themes {
                    let theme = theme.clone();
                    step.run(
                        StepOptions::new(format!("Evaluate {theme}"), ActionType::Evaluation)
                            .with_unit_cost(0.001),
                        |_| async move { Ok(evaluate_theme(&theme)) },
                    )
                    .await?;
                }

                let themes = generation.themes.clone();
                let synthesis = step
                    .run(
                        StepOptions::new("Synthesize Final Names", ActionType::Synthesis)
                            .with_unit_cost(0.002),
                        |_| async move { Ok(synthesize_names(&prompt, &themes, 3)) },
                    )
                    .await?;
                Ok(synthesis.candidates)
            }),
        )
    }

    fn input(branches: usize) -> NamingInput {
        NamingInput {
            prompt: "Test".to_string(),
            branches,
        }
    }

    #[tokio::test]
    async fn three_themes_produce_five_line_items() {
        let run = naming_agent().invoke(input(3), InvokeOptions::new()).await.unwrap();

        assert_eq!(run.output.len(), 3);
        let items = &run.invoice.line_items;
        assert_eq!(items.len(), 5);
        assert!(items.iter().all(|i| i.status == BillingStatus::Success));
        assert_eq!(items[0].step_name, "Generate Name Themes");
        assert!(items[1..4].iter().all(|i| i.action_type == ActionType::Evaluation));
        assert_eq!(items[4].step_name, "Synthesize Final Names");

        let expected: f64 = items.iter().map(|i| i.unit_cost * i.quantity).sum();
        assert!((run.invoice.total - expected).abs() < 1e-9);
        assert!((run.invoice.total - 0.007).abs() < 1e-9);
    }

    #[tokio::test]
    async fn more_branches_cost_more() {
        let agent = naming_agent();
        let three = agent.invoke(input(3), InvokeOptions::new()).await.unwrap();
        let five = agent.invoke(input(5), InvokeOptions::new()).await.unwrap();

        assert_eq!(five.invoice.line_items.len(), 7);
        assert!(five.invoice.total > three.invoice.total);
        assert_ne!(three.trace_id, five.trace_id);
    }

    #[tokio::test]
    async fn step_trace_ids_hang_off_the_run_trace_id() {
        let run = naming_agent()
            .invoke(input(2), InvokeOptions::new().with_trace_id("upstream-trace"))
            .await
            .unwrap();
        assert_eq!(run.trace_id, "upstream-trace");
        for item in &run.invoice.line_items {
            let id = item.metadata["traceId"].as_str().unwrap();
            assert!(id.starts_with("upstream-trace:"), "{id}");
        }
    }

    #[tokio::test]
    async fn failing_step_surfaces_partial_invoice() {
        let agent = Agent::new(
            "failing",
            LambdaWorkflow::new(|step: StepExecutor, _input: Value, _ctx| async move {
                step.run(
                    StepOptions::<()>::new("Prepare", ActionType::LlmCall).with_unit_cost(0.002),
                    |_| async { Ok(()) },
                )
                .await?;
                step.run(
                    StepOptions::<()>::new("Explode", ActionType::Validation).with_unit_cost(0.1),
                    |_| async { Err(Error::Validation("boom".into())) },
                )
                .await?;
                Ok("unreachable")
            }),
        );

        let err = agent.invoke(json!({}), InvokeOptions::new()).await.unwrap_err();
        assert_eq!(err.agent_name, "failing");
        assert!(matches!(err.original_error(), Error::Validation(m) if m == "boom"));

        let items = &err.invoice.line_items;
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].step_name, "Explode");
        assert_eq!(items[1].status, BillingStatus::Error);
        assert_eq!(err.invoice.failed_items().count(), 1);
        assert!((err.invoice.total - 0.102).abs() < 1e-9);
    }

    #[tokio::test]
    async fn run_logs_start_success_and_context() {
        let sink = MemorySink::new();
        let seen_metadata = Arc::new(std::sync::Mutex::new(None));
        let captured = Arc::clone(&seen_metadata);
        let agent = Agent::new(
            "logged",
            LambdaWorkflow::new(move |_step: StepExecutor, _input: String, ctx: AgentContext| {
                let captured = Arc::clone(&captured);
                async move {
                    *captured.lock().unwrap() = Some((ctx.trace_id.clone(), ctx.metadata.clone()));
                    assert!(ctx.ledger.is_empty());
                    Ok(())
                }
            }),
        )
        .with_logger(Logger::with_sink("logged", Arc::new(sink.clone())));

        let run = agent
            .invoke(
                "x".repeat(100),
                InvokeOptions::new().with_metadata(metadata! { "user": "u-1" }),
            )
            .await
            .unwrap();

        let (trace_id, meta) = seen_metadata.lock().unwrap().clone().unwrap();
        assert_eq!(trace_id, run.trace_id);
        assert_eq!(meta["user"], json!("u-1"));

        let start = &sink.find("run.start")[0];
        assert_eq!(start.fields["agent"], json!("logged"));
        assert_eq!(start.fields["traceId"], json!(run.trace_id));
        let preview = start.fields["inputPreview"].as_str().unwrap();
        assert_eq!(preview.chars().count(), 64);
        assert!(preview.ends_with("..."));
        assert_eq!(sink.find("run.success").len(), 1);
    }

    #[tokio::test]
    async fn configured_currency_reaches_invoice() {
        let agent = naming_agent().with_config(RuntimeConfig {
            currency: "EUR".to_string(),
            ..RuntimeConfig::default()
        });
        let run = agent.invoke(input(1), InvokeOptions::new()).await.unwrap();
        assert_eq!(run.invoice.currency, "EUR");
    }

    #[tokio::test]
    async fn concurrent_runs_keep_separate_ledgers() {
        let agent = naming_agent();
        let (a, b) = tokio::join!(
            agent.invoke(input(2), InvokeOptions::new()),
            agent.invoke(input(4), InvokeOptions::new()),
        );
        assert_eq!(a.unwrap().invoice.line_items.len(), 4);
        assert_eq!(b.unwrap().invoice.line_items.len(), 6);
    }

    fn trends_agent(
        registry: Arc<CapabilityRegistry>,
    ) -> Agent<impl AgentWorkflow<Input = Value, Output = CapabilityOutput>> {
        let tool = CapabilityTool::new(registry, MARKET_TRENDS);
        Agent::new(
            "trends",
            LambdaWorkflow::new(move |step: StepExecutor, input: Value, _ctx| {
                let tool = tool.clone();
                async move { tool.invoke(&step, input, ToolInvokeOptions::new()).await }
            }),
        )
    }

    #[tokio::test]
    async fn unregistered_capability_fails_the_run_naming_it() {
        let agent = trends_agent(Arc::new(CapabilityRegistry::new()));

        let err = agent
            .invoke(json!({ "category": "coffee" }), InvokeOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.original_error(),
            Error::CapabilityNotFound { name } if name == "market-trends"
        ));

        let items = &err.invoice.line_items;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, BillingStatus::Error);
        assert_eq!(items[0].step_name, "market-trends tool call");
        assert_eq!(items[0].action_type, ActionType::ToolUse);
        assert_eq!(err.invoice.failed_items().count(), 1);
    }

    #[tokio::test]
    async fn registered_capability_bills_reported_figures() {
        let registry = Arc::new(CapabilityRegistry::new());
        registry.register(
            CapabilityDefinition::from_fn(MARKET_TRENDS, |_input, ctx| async move {
                Ok(CapabilityOutput::new(json!({ "parent": ctx.parent_trace_id }))
                    .with_unit_cost(0.004)
                    .with_quantity(2.0))
            })
            .with_default_unit_cost(0.001),
        );

        let run = trends_agent(registry)
            .invoke(json!({ "category": "coffee" }), InvokeOptions::new())
            .await
            .unwrap();
        assert_eq!(run.output.result["parent"], json!(run.trace_id));

        let items = &run.invoice.line_items;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, BillingStatus::Success);
        assert_eq!(items[0].unit_cost, 0.004);
        assert_eq!(items[0].quantity, 2.0);
        assert_eq!(run.invoice.total, 0.008);
        assert_eq!(
            items[0].metadata["headers"][PARENT_TRACE_HEADER],
            json!(run.trace_id)
        );

        let invoice = serde_json::to_value(&run.invoice).unwrap();
        assert_eq!(invoice["lineItems"][0]["unitCost"], json!(0.004));
    }

    #[test]
    fn summarize_input_bounds_previews() {
        assert_eq!(summarize_input(&json!("short"), 64), json!("short"));
        assert_eq!(summarize_input(&json!([1, 2, 3]), 64), json!("Array(3)"));
        assert_eq!(
            summarize_input(&json!({ "prompt": "p", "branches": 3 }), 64),
            json!("Object(prompt,branches)")
        );
        assert_eq!(
            summarize_input(&json!({ "a": 1, "b": 2, "c": 3, "d": 4, "e": 5, "f": 6 }), 64),
            json!("Object(a,b,c,d,e,…)")
        );
        assert_eq!(summarize_input(&json!(42), 64), json!(42));
        assert_eq!(summarize_input(&Value::Null, 64), Value::Null);
    }
}
