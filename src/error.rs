use thiserror::Error;

use crate::types::StepId;

/// Structural problems with a plan. These abort a run before any step executes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("Cycle detected among steps: {}", steps.join(", "))]
    Cycle { steps: Vec<StepId> },

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: StepId, dependency: StepId },

    #[error("Duplicate step id '{0}'")]
    DuplicateStep(StepId),

    #[error("Plan contains no steps")]
    Empty,
}

/// Per-step failures. Always captured into a failed `PlanResult`, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("Step '{step}' timed out after {timeout_ms}ms")]
    Timeout { step: StepId, timeout_ms: u64 },

    #[error("Step '{step}' failed: {message}")]
    Execution { step: StepId, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FallbackError {
    #[error("No eligible agents in fallback chain")]
    EmptyChain,

    #[error("All {attempts} fallback attempts failed; last error: {last_error}")]
    Exhausted { attempts: usize, last_error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RankerError {
    #[error("Capability ranker has not been warmed")]
    NotReady,

    #[error("Warm-up cancelled")]
    Cancelled,
}
