use std::collections::HashMap;

use crate::types::{AgentId, CapabilityId};

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    if a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();

    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}

/// Capability embeddings per agent.
#[derive(Debug, Clone, Default)]
pub struct CapabilityIndex {
    vectors: HashMap<AgentId, HashMap<CapabilityId, Vec<f32>>>,
}

impl CapabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, agent_id: &str, capability_id: &str, vector: Vec<f32>) {
        self.vectors
            .entry(agent_id.to_string())
            .or_default()
            .insert(capability_id.to_string(), vector);
    }

    pub fn contains(&self, agent_id: &str, capability_id: &str) -> bool {
        self.vectors
            .get(agent_id)
            .map(|caps| caps.contains_key(capability_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.vectors.values().map(|caps| caps.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest-similarity capability of `agent_id` against `query`, if it has any vectors.
    pub fn best_match(&self, agent_id: &str, query: &[f32]) -> Option<(CapabilityId, f32)> {
        self.vectors
            .get(agent_id)?
            .iter()
            .map(|(cap, vector)| (cap.clone(), cosine_similarity(query, vector)))
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
    }
}
