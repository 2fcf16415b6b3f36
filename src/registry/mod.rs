pub mod memory;

pub use memory::InMemoryRegistry;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::Agent;

/// Read-only view of the externally owned agent registry.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn list_agents(&self) -> Result<Vec<Agent>>;
    async fn get_agent(&self, id: &str) -> Result<Option<Agent>>;

    async fn agents_with_capability(&self, capability_id: &str) -> Result<Vec<Agent>> {
        Ok(self
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| a.has_capability(capability_id))
            .collect())
    }
}
