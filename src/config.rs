//! Runtime configuration for agents.

use serde::{Deserialize, Serialize};

use crate::billing::DEFAULT_CURRENCY;
use crate::Result;

/// Environment variable overriding [`RuntimeConfig::currency`].
pub const CURRENCY_ENV: &str = "STRINGCOST_CURRENCY";
/// Environment variable overriding [`RuntimeConfig::input_preview_chars`].
pub const PREVIEW_CHARS_ENV: &str = "STRINGCOST_INPUT_PREVIEW_CHARS";

/// Settings applied to every run of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Currency tag written on invoices.
    pub currency: String,
    /// String inputs longer than this are truncated in the `run.start` preview.
    pub input_preview_chars: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            currency: DEFAULT_CURRENCY.to_string(),
            input_preview_chars: 64,
        }
    }
}

impl RuntimeConfig {
    /// Parse from JSON. Missing keys take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Defaults overridden by `STRINGCOST_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(currency) = lookup(CURRENCY_ENV).filter(|c| !c.trim().is_empty()) {
            config.currency = currency.trim().to_string();
        }
        if let Some(raw) = lookup(PREVIEW_CHARS_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(chars) if chars >= 4 => config.input_preview_chars = chars,
                _ => tracing::warn!(
                    value = %raw,
                    "ignoring invalid {PREVIEW_CHARS_ENV}, using {}",
                    config.input_preview_chars
                ),
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn json_fills_missing_keys_with_defaults() {
        let config = RuntimeConfig::from_json_str(r#"{"currency":"EUR"}"#).unwrap();
        assert_eq!(config.currency, "EUR");
        assert_eq!(config.input_preview_chars, 64);
    }

    #[test]
    fn malformed_json_is_an_error() {
        let err = RuntimeConfig::from_json_str("{").unwrap_err();
        assert_eq!(err.kind(), "Json");
    }

    #[test]
    fn env_overrides_and_ignores_bad_values() {
        let vars: HashMap<&str, &str> = [
            (CURRENCY_ENV, " GBP "),
            (PREVIEW_CHARS_ENV, "not-a-number"),
        ]
        .into_iter()
        .collect();
        let config = RuntimeConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.currency, "GBP");
        assert_eq!(config.input_preview_chars, 64);

        let config = RuntimeConfig::from_lookup(|k| {
            (k == PREVIEW_CHARS_ENV).then(|| "128".to_string())
        });
        assert_eq!(config.input_preview_chars, 128);
        assert_eq!(config.currency, "USD");
    }
}
