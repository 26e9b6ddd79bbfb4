//! The workflow trait agents run, and a closure-backed implementation.

use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

use serde::Serialize;

use crate::{AgentContext, Result, StepExecutor};

/// Domain logic run by an [`Agent`](crate::Agent).
///
/// A workflow receives the run's [`StepExecutor`], its typed input and the
/// run context. It may issue any number of steps, branch on their results and
/// invoke capabilities through [`CapabilityTool`](crate::CapabilityTool).
#[async_trait]
pub trait AgentWorkflow: Send + Sync {
    /// The input type for this workflow. Serialized only to build a log preview.
    type Input: Serialize + Send;
    /// The output type produced by this workflow.
    type Output: Send;

    /// Execute one run.
    async fn run(
        &self,
        step: &StepExecutor,
        input: Self::Input,
        ctx: &AgentContext,
    ) -> Result<Self::Output>;
}

/// A workflow constructed from a closure.
///
/// # Example
///
/// ```rust
/// use stringcost::{ActionType, LambdaWorkflow, StepOptions};
///
/// let workflow = LambdaWorkflow::new(|step, prompt: String, _ctx| async move {
///     step.run(
///         StepOptions::new("Echo", ActionType::LlmCall).with_unit_cost(0.001),
///         |_| async move { Ok(prompt) },
///     )
///     .await
/// });
/// ```
pub struct LambdaWorkflow<I, O, F> {
    f: F,
    _phantom: PhantomData<fn(I) -> O>,
}

impl<I, O, F, Fut> LambdaWorkflow<I, O, F>
where
    F: Fn(StepExecutor, I, AgentContext) -> Fut + Send + Sync + 'static,
    I: Serialize + Send + 'static,
    O: Send + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<I, O, F, Fut> AgentWorkflow for LambdaWorkflow<I, O, F>
where
    F: Fn(StepExecutor, I, AgentContext) -> Fut + Send + Sync + 'static,
    I: Serialize + Send + 'static,
    O: Send + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    type Input = I;
    type Output = O;

    async fn run(&self, step: &StepExecutor, input: I, ctx: &AgentContext) -> Result<O> {
        (self.f)(step.clone(), input, ctx.clone()).await
    }
}
