pub mod agent;
pub mod plan;
pub mod ranking;

pub use agent::{Agent, CapabilityDescriptor};
pub use plan::{DagPlan, DagResult, PlanResult, PlanStep, StepContext};
pub use ranking::{BudgetCheckResult, BudgetLineItem, RankedAgent, TaskIntent};

use serde::{Deserialize, Serialize};

pub type AgentId = String;
pub type CapabilityId = String;
pub type StepId = String;
pub type TaskId = uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,    // Calls flow normally
    Open,      // Calls rejected until cooldown elapses
    HalfOpen,  // Limited trial calls allowed
}

impl CircuitState {
    pub fn as_str(&self) -> &str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
}
