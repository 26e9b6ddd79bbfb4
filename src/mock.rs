//! Deterministic stand-ins for generative calls and a sample capability.
//!
//! Useful for demos and tests: the same prompt always yields the same themes,
//! scores and names, with plausible token estimates attached.

use serde::{Deserialize, Serialize};

use crate::capability::{CapabilityDefinition, CapabilityOutput};
use crate::metadata;

const ADJECTIVES: [&str; 10] = [
    "Velvet", "Solar", "Aurora", "Harbor", "Cinder", "Verdant", "Nimbus", "Juniper", "Golden",
    "Rustic",
];

const NOUNS: [&str; 10] = [
    "Blend",
    "Roastery",
    "Collective",
    "Parlor",
    "Lab",
    "Atelier",
    "Vault",
    "Folio",
    "House",
    "Haven",
];

const SUFFIXES: [&str; 4] = ["Cafe", "Roasters", "Bar", "Works"];

/// Themes generated for a prompt, with token estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeGeneration {
    pub themes: Vec<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Score and rationale for one theme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeEvaluation {
    pub theme: String,
    pub score: f64,
    pub rationale: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Final candidate names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Synthesis {
    pub candidates: Vec<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Roughly 1.2 tokens per whitespace-separated word, at least one.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    let words = text.split_whitespace().count() as f64;
    ((words * 1.2).ceil() as u64).max(1)
}

fn seeded_index(seed: &str, index: usize, modulo: usize) -> usize {
    let index = index as u32;
    let hash = seed.encode_utf16().fold(0u32, |hash, unit| {
        hash.wrapping_mul(31)
            .wrapping_add(u32::from(unit))
            .wrapping_add(index)
    });
    hash as usize % modulo
}

/// Produce `branches` name themes for a prompt.
#[must_use]
pub fn generate_themes(prompt: &str, branches: usize) -> ThemeGeneration {
    let themes: Vec<String> = (0..branches)
        .map(|i| {
            let adjective = ADJECTIVES[seeded_index(prompt, i, ADJECTIVES.len())];
            let noun = NOUNS[seeded_index(prompt, i + 7, NOUNS.len())];
            format!("{adjective} {noun}")
        })
        .collect();
    let completion_tokens = themes.iter().map(|t| estimate_tokens(t)).sum();
    ThemeGeneration {
        themes,
        prompt_tokens: estimate_tokens(prompt),
        completion_tokens,
    }
}

/// Score a theme between 0.6 and 1.0.
#[must_use]
pub fn evaluate_theme(theme: &str) -> ThemeEvaluation {
    let raw = 0.6 + (seeded_index(theme, theme.len(), 100) as f64 / 100.0) * 0.4;
    let score = (raw * 100.0).round() / 100.0;
    let rationale = format!(
        "Theme \"{theme}\" blends sensory imagery with a welcoming mood suitable for specialty coffee."
    );
    ThemeEvaluation {
        theme: theme.to_string(),
        score,
        prompt_tokens: estimate_tokens(&format!("Evaluate the theme {theme}")),
        completion_tokens: estimate_tokens(&rationale),
        rationale,
    }
}

/// Combine themes into `finalists` candidate names.
#[must_use]
pub fn synthesize_names(prompt: &str, themes: &[String], finalists: usize) -> Synthesis {
    let candidates: Vec<String> = if themes.is_empty() {
        Vec::new()
    } else {
        (0..finalists)
            .map(|i| format!("{} {}", themes[i % themes.len()], SUFFIXES[i % SUFFIXES.len()]))
            .collect()
    };
    let completion_tokens = candidates.iter().map(|c| estimate_tokens(c)).sum();
    Synthesis {
        candidates,
        prompt_tokens: estimate_tokens(&format!("{prompt}{}", themes.join(" "))),
        completion_tokens,
    }
}

/// Input of the market-trends capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTrendsInput {
    pub category: String,
    #[serde(default)]
    pub region: Option<String>,
}

/// Output of the market-trends capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTrends {
    pub descriptors: Vec<String>,
    pub summary: String,
}

/// Name the market-trends capability is registered under.
pub const MARKET_TRENDS: &str = "market-trends";

/// A capability returning trend descriptors for a beverage category.
/// Bills 0.0005 per descriptor returned.
#[must_use]
pub fn market_trends_capability() -> CapabilityDefinition {
    CapabilityDefinition::from_typed_fn(MARKET_TRENDS, |input: MarketTrendsInput, ctx| async move {
        let descriptors: &[&str] = match input.category.as_str() {
            "coffee" => &["single-origin", "nitro", "oat milk", "sustainable", "seasonal"],
            "tea" => &["functional", "matcha", "boba", "botanical", "sparkling"],
            "pastry" => &["laminated", "gluten-free", "heritage", "micro-batch"],
            _ => &["artisan", "small-batch", "seasonal"],
        };
        let region = input.region.unwrap_or_else(|| "global".to_string());
        let summary = format!(
            "Consumers in {region} respond to {} concepts.",
            descriptors[..3].join(", ")
        );
        ctx.logger.info(
            "market-trends.respond",
            metadata! { "category": input.category, "region": region.as_str() },
        );

        let payload = MarketTrends {
            descriptors: descriptors.iter().map(|d| d.to_string()).collect(),
            summary,
        };
        Ok(CapabilityOutput::from_result(&payload)?
            .with_metadata(metadata! { "descriptors": payload.descriptors, "region": region })
            .with_unit_cost(0.0005)
            .with_quantity(descriptors.len() as f64))
    })
    .with_description("Returns trend descriptors for specialty beverage markets.")
    .with_default_unit_cost(0.0005)
}
