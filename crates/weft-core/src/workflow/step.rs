//! Step executor capability contract.
//!
//! The engine is agnostic to what actually performs a step. Anything that can
//! take a rendered prompt and produce a JSON output implements `StepExecutor`;
//! production wires in an agent runtime, tests wire in scripted mocks.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use weft_types::workflow::StepDefinition;

/// Step execution failure.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// The executor reported a failure. `retryable` controls whether the
    /// engine's retry loop may attempt the step again.
    #[error("step failed: {message}")]
    Failed { message: String, retryable: bool },

    /// The step did not settle within its timeout. Always retryable.
    #[error("step timed out after {0:?}")]
    Timeout(Duration),
}

impl StepError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StepError::Failed { retryable, .. } => *retryable,
            StepError::Timeout(_) => true,
        }
    }
}

/// Executes individual workflow steps.
///
/// `timeout` is the effective per-step budget; implementations should respect
/// it, but the engine enforces it regardless.
pub trait StepExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        step: &StepDefinition,
        rendered_prompt: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<serde_json::Value, StepError>> + Send;
}
