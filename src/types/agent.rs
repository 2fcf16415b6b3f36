use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{AgentId, CapabilityId};

/// A typed unit of work an agent advertises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub id: CapabilityId,
    pub name: String,
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub subcategories: Vec<String>,
}

impl CapabilityDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            category: category.into(),
            subcategories: Vec::new(),
        }
    }

    pub fn with_subcategories(mut self, subcategories: Vec<String>) -> Self {
        self.subcategories = subcategories;
        self
    }

    /// Text handed to the embedding provider for this capability.
    pub fn embedding_text(&self) -> String {
        let mut parts = vec![
            self.name.clone(),
            self.description.clone(),
            format!("Category: {}", self.category),
        ];
        if !self.subcategories.is_empty() {
            parts.push(format!("Subcategories: {}", self.subcategories.join(", ")));
        }
        parts.join(". ")
    }
}

/// A specialist service as seen through the registry snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub capabilities: Vec<CapabilityDescriptor>,
    #[serde(default)]
    pub price_by_capability: HashMap<CapabilityId, f64>,
    #[serde(default = "default_true")]
    pub healthy: bool,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Agent {
    pub fn new(id: impl Into<String>, capabilities: Vec<CapabilityDescriptor>) -> Self {
        Self {
            id: id.into(),
            capabilities,
            price_by_capability: HashMap::new(),
            healthy: true,
            active: true,
            last_health_check: None,
            endpoint: None,
        }
    }

    pub fn with_price(mut self, capability_id: impl Into<String>, price: f64) -> Self {
        self.price_by_capability.insert(capability_id.into(), price);
        self
    }

    pub fn with_health_check(mut self, healthy: bool, at: DateTime<Utc>) -> Self {
        self.healthy = healthy;
        self.last_health_check = Some(at);
        self
    }

    pub fn price_for(&self, capability_id: &str) -> Option<f64> {
        self.price_by_capability.get(capability_id).copied()
    }

    pub fn has_capability(&self, capability_id: &str) -> bool {
        self.capabilities.iter().any(|c| c.id == capability_id)
    }
}
