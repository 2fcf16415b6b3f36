use serde::{Deserialize, Serialize};

use super::{AgentId, CapabilityId};

/// What the caller wants done, with the query embedding already computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskIntent {
    pub text: String,
    pub embedding: Vec<f32>,
}

impl TaskIntent {
    pub fn new(text: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            text: text.into(),
            embedding,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedAgent {
    pub agent_id: AgentId,
    pub score: f64,
    pub confidence: f64,
    pub reasoning: String,
    pub capability_id: Option<CapabilityId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetLineItem {
    pub agent_id: AgentId,
    pub capability_id: Option<CapabilityId>,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetCheckResult {
    pub within_budget: bool,
    pub total_cost: f64,
    pub max_budget: f64,
    pub breakdown: Vec<BudgetLineItem>,
}

impl BudgetCheckResult {
    pub fn overrun(&self) -> f64 {
        (self.total_cost - self.max_budget).max(0.0)
    }
}
