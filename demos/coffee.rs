//! Coffee shop naming agent.
//!
//! Generates name themes, evaluates each, synthesizes finalists, runs a QA
//! gate and optionally fetches market trends through a registered capability.
//! Prints the output and invoice as JSON.
//!
//! ```text
//! RUST_LOG=info cargo run --example coffee -- "cozy harbor cafe" 5
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stringcost::mock::{
    evaluate_theme, generate_themes, market_trends_capability, synthesize_names, MarketTrends,
    Synthesis, ThemeEvaluation, ThemeGeneration, MARKET_TRENDS,
};
use stringcost::{
    metadata, ActionType, Agent, AgentContext, AgentWorkflow, BillingEventInput, CapabilityRegistry,
    CapabilityTool, Error, InvokeOptions, Result, RuntimeConfig, StepExecutor, StepOptions,
    ToolInvokeOptions,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CoffeeInput {
    prompt: String,
    branches: usize,
    finalists: usize,
    fail_on_duplicate: bool,
    include_market_trends: bool,
}

#[derive(Debug, Serialize)]
struct CoffeeOutput {
    themes: ThemeGeneration,
    evaluations: Vec<ThemeEvaluation>,
    synthesis: Synthesis,
    market_trends: Option<MarketTrends>,
}

struct CoffeeWorkflow {
    trends: CapabilityTool,
}

#[async_trait::async_trait]
impl AgentWorkflow for CoffeeWorkflow {
    type Input = CoffeeInput;
    type Output = CoffeeOutput;

    async fn run(
        &self,
        step: &StepExecutor,
        input: CoffeeInput,
        ctx: &AgentContext,
    ) -> Result<CoffeeOutput> {
        let prompt = input.prompt.as_str();
        let branches = input.branches;
        let finalists = input.finalists;

        let themes = step
            .run(
                StepOptions::new("Generate Name Themes", ActionType::LlmCall)
                    .with_unit_cost(0.002)
                    .with_metadata(metadata! { "prompt": prompt, "branches": branches })
                    .with_cost_calculator(|c| c.unit_cost * c.quantity),
                |runtime| async move {
                    let generation = generate_themes(prompt, branches);
                    runtime.set_quantity(generation.themes.len() as f64);
                    runtime.record_metadata(metadata! {
                        "promptTokens": generation.prompt_tokens,
                        "completionTokens": generation.completion_tokens,
                    });
                    Ok(generation)
                },
            )
            .await?;

        let mut evaluations = Vec::with_capacity(themes.themes.len());
        for theme in &themes.themes {
            let evaluation = step
                .run(
                    StepOptions::new(format!("Evaluate Theme: {theme}"), ActionType::Evaluation)
                        .with_unit_cost(0.001)
                        .with_metadata(metadata! { "theme": theme })
                        .with_cost_calculator(|c| c.unit_cost),
                    |runtime| async move {
                        let result = evaluate_theme(theme);
                        runtime.record_metadata(metadata! {
                            "promptTokens": result.prompt_tokens,
                            "completionTokens": result.completion_tokens,
                            "score": result.score,
                        });
                        Ok(result)
                    },
                )
                .await?;
            evaluations.push(evaluation);
        }

        let mut ranked = evaluations.clone();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        let ranked: Vec<String> = ranked
            .into_iter()
            .take(finalists)
            .map(|e| e.theme)
            .collect();

        let synthesis = step
            .run(
                StepOptions::new("Synthesize Final Names", ActionType::LlmCall)
                    .with_unit_cost(0.002)
                    .with_metadata(metadata! { "finalists": finalists }),
                |runtime| async move {
                    let response = synthesize_names(prompt, &ranked, finalists);
                    runtime.set_quantity(response.candidates.len() as f64);
                    runtime.record_metadata(metadata! {
                        "promptTokens": response.prompt_tokens,
                        "completionTokens": response.completion_tokens,
                    });
                    Ok(response)
                },
            )
            .await?;

        let duplicates = find_duplicates(&synthesis.candidates);
        let gate_duplicates = duplicates.clone();
        let fail_on_duplicate = input.fail_on_duplicate;
        step.run(
            StepOptions::<()>::new("Final QA Gate", ActionType::Validation)
                .with_unit_cost(0.0005)
                .with_metadata(metadata! { "candidateCount": synthesis.candidates.len() })
                .with_finalize_billing(move |input| {
                    let mut event: BillingEventInput = input.default_event.clone();
                    event
                        .metadata
                        .insert("duplicates".to_string(), gate_duplicates.clone().into());
                    Some(event)
                }),
            |runtime| async move {
                let found = !duplicates.is_empty();
                runtime.record("duplicates", duplicates);
                if found && fail_on_duplicate {
                    return Err(Error::Validation("Duplicate coffee names detected".into()));
                }
                Ok(())
            },
        )
        .await?;

        let market_trends = if input.include_market_trends {
            self.fetch_trends(step, ctx).await
        } else {
            None
        };

        Ok(CoffeeOutput {
            themes,
            evaluations,
            synthesis,
            market_trends,
        })
    }
}

impl CoffeeWorkflow {
    /// Trends are optional; a failed lookup is billed but does not fail the run.
    async fn fetch_trends(&self, step: &StepExecutor, ctx: &AgentContext) -> Option<MarketTrends> {
        let options = ToolInvokeOptions::new()
            .with_name("Fetch Market Trends")
            .with_unit_cost(0.0005)
            .with_metadata(metadata! {
                "description": "Fetches current coffee market descriptors",
            });
        let input = serde_json::json!({ "category": "coffee", "region": "global" });
        match self.trends.invoke_as(step, input, options).await {
            Ok(trends) => Some(trends),
            Err(error) => {
                ctx.logger
                    .warn("market trends unavailable", metadata! { "error": error.to_string() });
                None
            }
        }
    }
}

fn find_duplicates(values: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut dupes: Vec<String> = Vec::new();
    for value in values {
        if !seen.insert(value.to_lowercase()) && !dupes.contains(value) {
            dupes.push(value.clone());
        }
    }
    dupes
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let prompt = args.next().unwrap_or_else(|| "cozy harbor cafe".to_string());
    let branches = args.next().and_then(|b| b.parse().ok()).unwrap_or(3);

    let registry = Arc::new(CapabilityRegistry::new());
    registry.register(market_trends_capability());

    let agent = Agent::new(
        "coffeeNameGenerator",
        CoffeeWorkflow {
            trends: CapabilityTool::new(Arc::clone(&registry), MARKET_TRENDS),
        },
    )
    .with_config(RuntimeConfig::from_env());

    let input = CoffeeInput {
        prompt,
        branches,
        finalists: 3,
        fail_on_duplicate: false,
        include_market_trends: true,
    };

    match agent.invoke(input, InvokeOptions::new()).await {
        Ok(run) => {
            println!("{}", serde_json::to_string_pretty(&run)?);
            Ok(())
        }
        Err(failure) => {
            eprintln!("{failure}: {}", failure.original_error());
            eprintln!("{}", serde_json::to_string_pretty(&failure.invoice)?);
            std::process::exit(1);
        }
    }
}
