//! External capabilities (tools) and the registry that resolves them by name.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::logger::Logger;
use crate::metadata::Metadata;
use crate::{Error, Result};

/// Header carrying the run trace id to a capability.
pub const PARENT_TRACE_HEADER: &str = "X-Parent-Trace-Id";

/// What the core hands a capability when it executes.
#[derive(Debug, Clone)]
pub struct CapabilityContext {
    /// Trace id of the step wrapping this execution.
    pub trace_id: String,
    /// Trace id of the run.
    pub parent_trace_id: String,
    /// Logger bound with the step context.
    pub logger: Logger,
    /// Always contains [`PARENT_TRACE_HEADER`].
    pub headers: BTreeMap<String, String>,
}

/// Result of a capability execution, with optional billing overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityOutput {
    /// Payload handed back to the caller.
    pub result: Value,
    /// Fields merged into the line-item metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Unit cost overriding the declared one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_cost: Option<f64>,
    /// Quantity overriding the caller's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
}

impl CapabilityOutput {
    /// Wrap a payload with no billing overrides.
    pub fn new(result: impl Into<Value>) -> Self {
        Self {
            result: result.into(),
            ..Self::default()
        }
    }

    /// Serialize a typed payload into the result.
    pub fn from_result<T: Serialize>(result: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_value(result)?))
    }

    /// Report line-item metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Report the unit cost.
    pub fn with_unit_cost(mut self, unit_cost: f64) -> Self {
        self.unit_cost = Some(unit_cost);
        self
    }

    /// Report the quantity.
    pub fn with_quantity(mut self, quantity: f64) -> Self {
        self.quantity = Some(quantity);
        self
    }

    /// Deserialize the result payload.
    pub fn result_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.result.clone())?)
    }
}

/// An externally implemented operation invocable as a step.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn execute(&self, input: Value, ctx: CapabilityContext) -> Result<CapabilityOutput>;
}

/// A capability backed by a closure over JSON input.
pub struct FnCapability<F> {
    f: F,
}

#[async_trait]
impl<F> Capability for FnCapability<F>
where
    F: Fn(Value, CapabilityContext) -> BoxFuture<'static, Result<CapabilityOutput>>
        + Send
        + Sync,
{
    async fn execute(&self, input: Value, ctx: CapabilityContext) -> Result<CapabilityOutput> {
        (self.f)(input, ctx).await
    }
}

/// A capability backed by a closure over a typed input.
pub struct TypedCapability<I, F> {
    f: F,
    _input: PhantomData<fn(I)>,
}

#[async_trait]
impl<I, F, Fut> Capability for TypedCapability<I, F>
where
    I: DeserializeOwned + Send + 'static,
    F: Fn(I, CapabilityContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CapabilityOutput>> + Send + 'static,
{
    async fn execute(&self, input: Value, ctx: CapabilityContext) -> Result<CapabilityOutput> {
        let input: I = serde_json::from_value(input)?;
        (self.f)(input, ctx).await
    }
}

/// A named capability as stored in a [`CapabilityRegistry`].
#[derive(Clone)]
pub struct CapabilityDefinition {
    /// Registry key.
    pub name: String,
    /// Human-readable summary.
    pub description: Option<String>,
    /// Unit cost billed when the caller does not set one.
    pub default_unit_cost: Option<f64>,
    handler: Arc<dyn Capability>,
}

impl fmt::Debug for CapabilityDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("default_unit_cost", &self.default_unit_cost)
            .finish_non_exhaustive()
    }
}

impl CapabilityDefinition {
    /// Define a capability from a [`Capability`] implementation.
    pub fn new(name: impl Into<String>, handler: impl Capability + 'static) -> Self {
        Self {
            name: name.into(),
            description: None,
            default_unit_cost: None,
            handler: Arc::new(handler),
        }
    }

    /// Define a capability from a closure over JSON input.
    ///
    /// ```rust
    /// use stringcost::{CapabilityDefinition, CapabilityOutput};
    ///
    /// let echo = CapabilityDefinition::from_fn("echo", |input, _ctx| async move {
    ///     Ok(CapabilityOutput::new(input))
    /// })
    /// .with_default_unit_cost(0.0001);
    /// assert_eq!(echo.name, "echo");
    /// ```
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, CapabilityContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CapabilityOutput>> + Send + 'static,
    {
        let boxed = move |input: Value, ctx: CapabilityContext| -> BoxFuture<'static, Result<CapabilityOutput>> {
            Box::pin(f(input, ctx))
        };
        Self::new(name, FnCapability { f: boxed })
    }

    /// Define a capability whose JSON input is deserialized into `I` first.
    /// Input that does not deserialize fails with [`Error::Json`].
    pub fn from_typed_fn<I, F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        F: Fn(I, CapabilityContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CapabilityOutput>> + Send + 'static,
    {
        Self::new(
            name,
            TypedCapability {
                f,
                _input: PhantomData,
            },
        )
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the unit cost billed by default.
    pub fn with_default_unit_cost(mut self, unit_cost: f64) -> Self {
        self.default_unit_cost = Some(unit_cost);
        self
    }

    /// Run the handler.
    pub async fn execute(&self, input: Value, ctx: CapabilityContext) -> Result<CapabilityOutput> {
        self.handler.execute(input, ctx).await
    }
}

/// Name-keyed directory of capabilities.
///
/// Construct one at startup and share it behind an `Arc`. Reads and writes
/// are synchronized, so registration may race lookups safely; re-registering
/// a name replaces the previous definition in place.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    definitions: RwLock<IndexMap<String, Arc<CapabilityDefinition>>>,
}

impl CapabilityRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the definition registered under its name.
    pub fn register(&self, definition: CapabilityDefinition) {
        let mut definitions = self
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(capability = %definition.name, "registering capability");
        definitions.insert(definition.name.clone(), Arc::new(definition));
    }

    /// Remove a definition. No-op when the name is unknown.
    pub fn unregister(&self, name: &str) {
        self.definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(name);
    }

    /// Look up a definition by name.
    pub fn get(&self, name: &str) -> Result<Arc<CapabilityDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::CapabilityNotFound {
                name: name.to_string(),
            })
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// All definitions, in first-registration order.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<CapabilityDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Number of registered capabilities.
    pub fn len(&self) -> usize {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn constant(name: &str, value: i64) -> CapabilityDefinition {
        CapabilityDefinition::from_fn(name, move |_input, _ctx| async move {
            Ok(CapabilityOutput::new(value))
        })
    }

    fn ctx() -> CapabilityContext {
        CapabilityContext {
            trace_id: "root:step:1".to_string(),
            parent_trace_id: "root".to_string(),
            logger: Logger::new("test"),
            headers: BTreeMap::new(),
        }
    }

    #[test]
    fn get_missing_names_the_capability() {
        let registry = CapabilityRegistry::new();
        let err = registry.get("market-trends").unwrap_err();
        assert!(matches!(err, Error::CapabilityNotFound { ref name } if name == "market-trends"));
    }

    #[tokio::test]
    async fn reregistering_replaces_definition() {
        let registry = CapabilityRegistry::new();
        registry.register(constant("a", 1));
        registry.register(constant("b", 2));
        registry.register(constant("a", 3).with_description("second"));

        let names: Vec<_> = registry.list().iter().map(|d| d.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let a = registry.get("a").unwrap();
        assert_eq!(a.description.as_deref(), Some("second"));
        let out = a.execute(json!(null), ctx()).await.unwrap();
        assert_eq!(out.result, json!(3));
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = CapabilityRegistry::new();
        registry.register(constant("a", 1));
        registry.unregister("a");
        registry.unregister("a");
        assert!(registry.is_empty());
        assert!(!registry.contains("a"));
    }

    #[tokio::test]
    async fn typed_capability_rejects_bad_input() {
        #[derive(Deserialize)]
        struct Doubling {
            value: i64,
        }
        let double = CapabilityDefinition::from_typed_fn("double", |input: Doubling, _ctx| async move {
            Ok(CapabilityOutput::new(input.value * 2))
        });

        let out = double.execute(json!({ "value": 4 }), ctx()).await.unwrap();
        assert_eq!(out.result_as::<i64>().unwrap(), 8);

        let err = double.execute(json!({ "nope": true }), ctx()).await.unwrap_err();
        assert_eq!(err.kind(), "Json");
    }

    #[test]
    fn concurrent_registration_loses_nothing() {
        let registry = Arc::new(CapabilityRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let name = format!("cap-{t}-{i}");
                        registry.register(constant(&name, i));
                        assert!(registry.get(&name).is_ok());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 400);
    }
}
