use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::template::{resolve_template, summarize};
use crate::engine::StepExecutor;
use crate::registry::AgentRegistry;
use crate::resilience::SpecialistExecutor;
use crate::types::{PlanResult, PlanStep, StepContext};

#[derive(Debug, Serialize)]
struct SpecialistRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a StepContext>,
}

/// Calls specialists over HTTP at the endpoint advertised in the registry.
///
/// The agent receives `{"prompt": ..., "context": {...}}` and its JSON
/// response body becomes the step output.
pub struct HttpSpecialistClient {
    registry: Arc<dyn AgentRegistry>,
    client: reqwest::Client,
}

impl HttpSpecialistClient {
    pub fn new(registry: Arc<dyn AgentRegistry>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { registry, client })
    }

    async fn endpoint_for(&self, agent_id: &str) -> Result<String> {
        let agent = self
            .registry
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| anyhow!("Unknown agent '{}'", agent_id))?;
        agent
            .endpoint
            .ok_or_else(|| anyhow!("Agent '{}' has no endpoint", agent_id))
    }

    async fn post(&self, agent_id: &str, prompt: &str, context: Option<&StepContext>) -> Result<Value> {
        let endpoint = self.endpoint_for(agent_id).await?;

        let response = self
            .client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .json(&SpecialistRequest { prompt, context })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await?;
            anyhow::bail!("Agent {} returned {}: {}", agent_id, status, body);
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl SpecialistExecutor for HttpSpecialistClient {
    async fn call(&self, agent_id: &str, prompt: &str) -> Result<Value> {
        self.post(agent_id, prompt, None).await
    }
}

#[async_trait]
impl StepExecutor for HttpSpecialistClient {
    async fn execute(&self, step: &PlanStep, context: &StepContext) -> Result<PlanResult> {
        let prompt = resolve_template(&step.prompt_template, context);
        let output = self.post(&step.specialist, &prompt, Some(context)).await?;
        let summary = summarize(&output);
        Ok(PlanResult::succeeded(step, output, summary))
    }
}
