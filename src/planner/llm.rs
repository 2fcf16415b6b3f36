use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;

use super::Planner;
use crate::engine::validate_plan;
use crate::error::PlanError;
use crate::providers::{LLMProvider, Message};
use crate::registry::AgentRegistry;
use crate::types::{Agent, DagPlan};

const PLANNER_SYSTEM_PROMPT: &str = r#"You decompose user requests into a plan of steps executed by specialist agents.
Each step names exactly one specialist from the provided list.
Steps may reference earlier outputs with {{step-id.field}} in their prompt template.
Keep plans small; only add a dependency when a step needs another step's output.
Output a single JSON object only, no markdown code fences or explanation."#;

/// Asks an LLM for a plan over the agents currently in the registry.
pub struct LlmPlanner {
    llm_provider: Arc<dyn LLMProvider>,
    registry: Arc<dyn AgentRegistry>,
}

impl LlmPlanner {
    pub fn new(llm_provider: Arc<dyn LLMProvider>, registry: Arc<dyn AgentRegistry>) -> Self {
        Self {
            llm_provider,
            registry,
        }
    }

    fn build_planning_prompt(&self, query: &str, agents: &[Agent]) -> String {
        let specialists = agents
            .iter()
            .filter(|a| a.active)
            .map(|a| {
                let caps = a
                    .capabilities
                    .iter()
                    .map(|c| format!("{} ({})", c.id, c.description))
                    .collect::<Vec<_>>()
                    .join("; ");
                format!("- {}: {}", a.id, caps)
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"Request: {query}

Available specialists:
{specialists}

Output JSON with this shape:
{{"steps": [{{"id": "step-1", "specialist": "<agent id>", "promptTemplate": "...", "dependencies": [], "estimatedCost": 0.0, "capability": "<capability id>"}}]}}"#
        )
    }
}

/// Pull the outermost JSON object out of a completion that may carry fences or chatter.
fn extract_json_object(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&response[start..=end])
}

fn parse_plan(response: &str) -> Result<DagPlan> {
    let json = extract_json_object(response)
        .ok_or_else(|| anyhow!("Planner response contained no JSON object"))?;
    let parsed: DagPlan =
        serde_json::from_str(json).map_err(|e| anyhow!("Failed to parse plan JSON: {}", e))?;

    if parsed.is_empty() {
        return Err(PlanError::Empty.into());
    }
    // Recompute rather than trusting the model's arithmetic.
    let plan = DagPlan::new(parsed.steps);
    validate_plan(&plan)?;
    Ok(plan)
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan_dag(&self, query: &str) -> Result<DagPlan> {
        let agents = self.registry.list_agents().await?;
        let prompt = self.build_planning_prompt(query, &agents);

        let response = self
            .llm_provider
            .complete(vec![
                Message::system(PLANNER_SYSTEM_PROMPT),
                Message::user(prompt),
            ])
            .await?;

        let plan = parse_plan(&response)?;
        log::info!(
            "Planned {} steps for request (estimated cost {:.4})",
            plan.steps.len(),
            plan.total_estimated_cost
        );
        Ok(plan)
    }
}
