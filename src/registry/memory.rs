use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::AgentRegistry;
use crate::types::{Agent, AgentId};

/// Registry snapshot held in memory, ordered by agent id.
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    agents: Arc<RwLock<BTreeMap<AgentId, Agent>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agents(agents: Vec<Agent>) -> Self {
        let map = agents.into_iter().map(|a| (a.id.clone(), a)).collect();
        Self {
            agents: Arc::new(RwLock::new(map)),
        }
    }

    /// Load a list of agents from a `.yaml`/`.yml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading registry file {}", path.display()))?;
        let agents: Vec<Agent> = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)?,
            _ => serde_yaml::from_str(&raw)?,
        };
        Ok(Self::with_agents(agents))
    }

    pub async fn upsert(&self, agent: Agent) {
        self.agents.write().await.insert(agent.id.clone(), agent);
    }

    pub async fn set_health(&self, agent_id: &str, healthy: bool, at: DateTime<Utc>) -> bool {
        match self.agents.write().await.get_mut(agent_id) {
            Some(agent) => {
                agent.healthy = healthy;
                agent.last_health_check = Some(at);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl AgentRegistry for InMemoryRegistry {
    async fn list_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.agents.read().await.values().cloned().collect())
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        Ok(self.agents.read().await.get(id).cloned())
    }
}
