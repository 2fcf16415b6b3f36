pub mod llm;

pub use llm::LlmPlanner;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::DagPlan;

/// Turns a free-form request into a multi-step plan.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan_dag(&self, query: &str) -> Result<DagPlan>;
}
