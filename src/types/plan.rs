use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::{AgentId, CapabilityId, StepId};

/// Outputs of every step that has completed successfully so far, keyed by step id.
pub type StepContext = HashMap<StepId, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub id: StepId,
    pub specialist: AgentId,
    pub prompt_template: String,
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    #[serde(default)]
    pub estimated_cost: f64,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub capability: Option<CapabilityId>,
}

impl PlanStep {
    pub fn new(
        id: impl Into<String>,
        specialist: impl Into<String>,
        prompt_template: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            specialist: specialist.into(),
            prompt_template: prompt_template.into(),
            dependencies: Vec::new(),
            estimated_cost: 0.0,
            timeout_ms: None,
            capability: None,
        }
    }

    pub fn depends_on(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_cost(mut self, estimated_cost: f64) -> Self {
        self.estimated_cost = estimated_cost;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagPlan {
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub total_estimated_cost: f64,
}

impl DagPlan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        let total_estimated_cost = steps.iter().map(|s| s.estimated_cost).sum();
        Self {
            steps,
            total_estimated_cost,
        }
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Outcome of a single plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResult {
    pub step_id: StepId,
    pub specialist: AgentId,
    pub success: bool,
    pub output: Value,
    pub summary: String,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub skipped: bool,
}

impl PlanResult {
    pub fn succeeded(step: &PlanStep, output: Value, summary: impl Into<String>) -> Self {
        Self {
            step_id: step.id.clone(),
            specialist: step.specialist.clone(),
            success: true,
            output,
            summary: summary.into(),
            cost: step.estimated_cost,
            duration_ms: 0,
            skipped: false,
        }
    }

    pub fn failed(step: &PlanStep, summary: impl Into<String>) -> Self {
        Self {
            step_id: step.id.clone(),
            specialist: step.specialist.clone(),
            success: false,
            output: Value::Null,
            summary: summary.into(),
            cost: 0.0,
            duration_ms: 0,
            skipped: false,
        }
    }

    pub fn skipped(step: &PlanStep, summary: impl Into<String>) -> Self {
        Self {
            skipped: true,
            ..Self::failed(step, summary)
        }
    }
}

/// Outcome of a whole plan run. Partial progress is always preserved in `results`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagResult {
    pub success: bool,
    pub results: Vec<PlanResult>,
    pub total_cost: f64,
    pub duration_ms: u64,
}

impl DagResult {
    pub fn result_for(&self, step_id: &str) -> Option<&PlanResult> {
        self.results.iter().find(|r| r.step_id == step_id)
    }

    pub fn completed(&self) -> impl Iterator<Item = &PlanResult> {
        self.results.iter().filter(|r| r.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &PlanResult> {
        self.results.iter().filter(|r| !r.success && !r.skipped)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &PlanResult> {
        self.results.iter().filter(|r| r.skipped)
    }

    pub fn is_partial_failure(&self) -> bool {
        !self.success && self.completed().next().is_some()
    }
}
