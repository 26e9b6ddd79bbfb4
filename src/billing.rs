//! Per-run billing ledger and invoices.
//!
//! Every billed step appends one [`BillingEvent`] to the run's [`BillingLedger`].
//! The ledger is append-only; [`BillingLedger::invoice`] snapshots it into an
//! [`Invoice`] whose total is rounded to six decimal places.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::metadata::Metadata;

/// Currency used when none is configured.
pub const DEFAULT_CURRENCY: &str = "USD";

/// Decimal places kept in invoice totals.
pub const TOTAL_PRECISION: i32 = 6;

/// Free-form category of the work a line item bills for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionType {
    /// A call to a language model.
    LlmCall,
    /// An external capability invocation.
    ToolUse,
    /// Scoring or ranking of intermediate output.
    Evaluation,
    /// A gate that may reject the run.
    Validation,
    /// Combining earlier results into a final answer.
    Synthesis,
    /// Any other tag, kept verbatim.
    Custom(String),
}

impl ActionType {
    /// The snake_case tag this variant serializes as.
    pub fn as_str(&self) -> &str {
        match self {
            Self::LlmCall => "llm_call",
            Self::ToolUse => "tool_use",
            Self::Evaluation => "evaluation",
            Self::Validation => "validation",
            Self::Synthesis => "synthesis",
            Self::Custom(tag) => tag,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ActionType {
    fn from(tag: &str) -> Self {
        match tag {
            "llm_call" => Self::LlmCall,
            "tool_use" => Self::ToolUse,
            "evaluation" => Self::Evaluation,
            "validation" => Self::Validation,
            "synthesis" => Self::Synthesis,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for ActionType {
    fn from(tag: String) -> Self {
        Self::from(tag.as_str())
    }
}

impl Serialize for ActionType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ActionType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

/// Outcome of the step a line item bills for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingStatus {
    /// The step returned a value.
    #[default]
    Success,
    /// The step failed; the item is billed anyway.
    Error,
}

/// A billing event before sanitization. Missing numbers take the ledger defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingEventInput {
    /// Human-readable step name.
    pub step_name: String,
    /// Category of the billed work.
    pub action_type: ActionType,
    /// Cost per unit; defaults to `0`.
    #[serde(default)]
    pub unit_cost: Option<f64>,
    /// Units consumed; defaults to `1`.
    #[serde(default)]
    pub quantity: Option<f64>,
    /// Overrides `unit_cost * quantity` when set.
    #[serde(default)]
    pub total: Option<f64>,
    /// Free-form fields copied onto the line item.
    #[serde(default)]
    pub metadata: Metadata,
    /// Success or error of the billed step.
    #[serde(default)]
    pub status: BillingStatus,
}

impl BillingEventInput {
    /// Create an event with no figures set.
    pub fn new(step_name: impl Into<String>, action_type: impl Into<ActionType>) -> Self {
        Self {
            step_name: step_name.into(),
            action_type: action_type.into(),
            unit_cost: None,
            quantity: None,
            total: None,
            metadata: Metadata::new(),
            status: BillingStatus::Success,
        }
    }

    /// Set the cost per unit.
    pub fn with_unit_cost(mut self, unit_cost: f64) -> Self {
        self.unit_cost = Some(unit_cost);
        self
    }

    /// Set the number of units.
    pub fn with_quantity(mut self, quantity: f64) -> Self {
        self.quantity = Some(quantity);
        self
    }

    /// Set an explicit total.
    pub fn with_total(mut self, total: f64) -> Self {
        self.total = Some(total);
        self
    }

    /// Replace the metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the step outcome.
    pub fn with_status(mut self, status: BillingStatus) -> Self {
        self.status = status;
        self
    }
}

/// One recorded line item. All numbers are finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingEvent {
    /// Human-readable step name.
    pub step_name: String,
    /// Category of the billed work.
    pub action_type: ActionType,
    /// Cost per unit.
    pub unit_cost: f64,
    /// Units consumed.
    pub quantity: f64,
    /// Amount billed for this item.
    pub total: f64,
    /// Trace id, duration and any step-recorded fields.
    pub metadata: Metadata,
    /// Outcome of the step.
    pub status: BillingStatus,
}

/// Snapshot of a ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    /// ISO currency code, `USD` unless configured.
    pub currency: String,
    /// Sum of line item totals, rounded to [`TOTAL_PRECISION`] places.
    pub total: f64,
    /// Items in commit order.
    pub line_items: Vec<BillingEvent>,
}

impl Invoice {
    /// Line items billed for failed steps.
    pub fn failed_items(&self) -> impl Iterator<Item = &BillingEvent> {
        self.line_items
            .iter()
            .filter(|item| item.status == BillingStatus::Error)
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    line_items: Vec<BillingEvent>,
    subtotal: f64,
}

/// Append-only record of the billing events of one run.
///
/// Appends are serialized behind a mutex, so line items appear in commit order
/// even when steps finish concurrently.
///
/// # Example
///
/// ```rust
/// use stringcost::{ActionType, BillingEventInput, BillingLedger};
///
/// let ledger = BillingLedger::new();
/// ledger.record(
///     BillingEventInput::new("Step A", ActionType::LlmCall)
///         .with_unit_cost(0.002)
///         .with_quantity(3.0),
/// );
/// ledger.record(BillingEventInput::new("Step B", ActionType::Validation).with_unit_cost(0.001));
///
/// let invoice = ledger.invoice();
/// assert_eq!(invoice.total, 0.007);
/// assert_eq!(invoice.line_items.len(), 2);
/// ```
#[derive(Debug)]
pub struct BillingLedger {
    currency: String,
    state: Mutex<LedgerState>,
}

impl Default for BillingLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl BillingLedger {
    /// Empty ledger billing in [`DEFAULT_CURRENCY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_currency(DEFAULT_CURRENCY)
    }

    /// Empty ledger billing in `currency`.
    pub fn with_currency(currency: impl Into<String>) -> Self {
        Self {
            currency: currency.into(),
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Currency stamped on invoices.
    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Sanitize and append an event, returning the stored line item.
    ///
    /// Never fails: a non-finite or missing unit cost becomes `0`, quantity
    /// becomes `1`, and total becomes `unit_cost * quantity` (or `0` if that
    /// product is itself not finite).
    pub fn record(&self, input: BillingEventInput) -> BillingEvent {
        let unit_cost = sanitize_number(input.unit_cost, 0.0);
        let quantity = sanitize_number(input.quantity, 1.0);
        let product = sanitize_number(Some(unit_cost * quantity), 0.0);
        let total = sanitize_number(input.total, product);

        let event = BillingEvent {
            step_name: input.step_name,
            action_type: input.action_type,
            unit_cost,
            quantity,
            total,
            metadata: input.metadata,
            status: input.status,
        };

        let mut state = self.lock();
        state.subtotal += total;
        state.line_items.push(event.clone());
        event
    }

    /// Copy of all line items in commit order.
    #[must_use]
    pub fn line_items(&self) -> Vec<BillingEvent> {
        self.lock().line_items.clone()
    }

    /// Running subtotal, rounded to [`TOTAL_PRECISION`] places.
    #[must_use]
    pub fn subtotal(&self) -> f64 {
        round_total(self.lock().subtotal)
    }

    /// Number of recorded line items.
    pub fn len(&self) -> usize {
        self.lock().line_items.len()
    }

    /// Whether nothing has been billed yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the ledger. The total is recomputed from the stored line items.
    #[must_use]
    pub fn invoice(&self) -> Invoice {
        let line_items = self.line_items();
        let total = round_total(line_items.iter().map(|item| item.total).sum());
        Invoice {
            currency: self.currency.clone(),
            total,
            line_items,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Return `value` if it is present and finite, otherwise `fallback`.
#[must_use]
pub fn sanitize_number(value: Option<f64>, fallback: f64) -> f64 {
    match value {
        Some(v) if v.is_finite() => v,
        _ => fallback,
    }
}

/// Round to [`TOTAL_PRECISION`] decimal places.
///
/// Values too large to scale are returned unchanged; they carry no fractional
/// precision at that magnitude anyway.
#[must_use]
pub fn round_total(value: f64) -> f64 {
    let factor = 10f64.powi(TOTAL_PRECISION);
    let scaled = value * factor;
    if !scaled.is_finite() {
        return value;
    }
    scaled.round() / factor
}
