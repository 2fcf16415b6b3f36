use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::metrics::CapabilityMetrics;
use crate::clock::Clock;
use crate::config::ReputationConfig;
use crate::storage::traits::{load_as, save_as, StateStore, REPUTATION_KEY};
use crate::types::{AgentId, CapabilityId, TaskId, VoteDirection};

/// Coarse per-agent counters plus the per-capability metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReputation {
    pub success_count: u64,
    pub failure_count: u64,
    pub upvotes: u64,
    pub downvotes: u64,
    pub global_score: f64,
    pub capabilities: HashMap<CapabilityId, CapabilityMetrics>,
}

impl AgentReputation {
    fn new(config: &ReputationConfig) -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            upvotes: 0,
            downvotes: 0,
            global_score: config.cold_start_score,
            capabilities: HashMap::new(),
        }
    }

    /// Unweighted mean of capability scores; unchanged when there are none.
    fn recompute_global(&mut self) {
        if self.capabilities.is_empty() {
            return;
        }
        let sum: f64 = self.capabilities.values().map(|m| m.current_score).sum();
        self.global_score = (sum / self.capabilities.len() as f64).clamp(0.0, 1.0);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub voter_id: String,
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub capability_id: Option<CapabilityId>,
    pub direction: VoteDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Recorded,
    Unchanged,
    Changed,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReputationState {
    agents: HashMap<AgentId, AgentReputation>,
    votes: HashMap<String, Vote>,
    #[serde(skip)]
    dirty: bool,
}

/// Time-decayed, per-capability scoring of agent outcomes.
///
/// Mutations only mark the state dirty; `flush` writes it to the store. Callers
/// flush at the end of each task.
pub struct ReputationEngine {
    config: ReputationConfig,
    state: Mutex<ReputationState>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl ReputationEngine {
    pub fn new(config: ReputationConfig, store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            state: Mutex::new(ReputationState::default()),
            store,
            clock,
        }
    }

    pub async fn load(
        config: ReputationConfig,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let restored: ReputationState = load_as(store.as_ref(), REPUTATION_KEY)
            .await?
            .unwrap_or_default();
        log::debug!("Restored reputation for {} agents", restored.agents.len());

        let engine = Self::new(config, store, clock);
        *engine.state.lock().await = restored;
        Ok(engine)
    }

    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    pub async fn record_success(&self, agent_id: &str, capability_id: Option<&str>) {
        self.record_outcome(agent_id, capability_id, true).await;
    }

    pub async fn record_failure(&self, agent_id: &str, capability_id: Option<&str>) {
        self.record_outcome(agent_id, capability_id, false).await;
    }

    async fn record_outcome(&self, agent_id: &str, capability_id: Option<&str>, success: bool) {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let config = &self.config;
        let agent = state
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentReputation::new(config));

        if success {
            agent.success_count += 1;
            agent.upvotes += 1;
        } else {
            agent.failure_count += 1;
            agent.downvotes += 1;
        }

        if let Some(capability_id) = capability_id {
            agent
                .capabilities
                .entry(capability_id.to_string())
                .or_insert_with(|| CapabilityMetrics::new(now, config))
                .record_outcome(success, now, config);
            agent.recompute_global();
        }
        state.dirty = true;
    }

    pub async fn record_latency(&self, agent_id: &str, capability_id: &str, latency_ms: u64) {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let config = &self.config;
        let agent = state
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentReputation::new(config));
        agent
            .capabilities
            .entry(capability_id.to_string())
            .or_insert_with(|| CapabilityMetrics::new(now, config))
            .record_latency(latency_ms, now, config);
        agent.recompute_global();
        state.dirty = true;
    }

    /// Capability score if tracked, else the agent's global score, else the
    /// cold-start default.
    pub async fn get_reputation_score(&self, agent_id: &str, capability_id: Option<&str>) -> f64 {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(agent) = state.agents.get_mut(agent_id) else {
            return self.config.cold_start_score;
        };

        if let Some(metrics) = capability_id.and_then(|c| agent.capabilities.get_mut(c)) {
            metrics.apply_decay(now, &self.config);
            metrics.recompute_score(&self.config);
            return metrics.current_score;
        }
        agent.global_score
    }

    pub async fn get_capability_metrics(
        &self,
        agent_id: &str,
        capability_id: &str,
    ) -> Option<CapabilityMetrics> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let metrics = state
            .agents
            .get_mut(agent_id)?
            .capabilities
            .get_mut(capability_id)?;
        metrics.apply_decay(now, &self.config);
        Some(metrics.clone())
    }

    pub async fn get_agent_reputation(&self, agent_id: &str) -> Option<AgentReputation> {
        self.state.lock().await.agents.get(agent_id).cloned()
    }

    /// Agents tracked for `capability_id`, best first.
    pub async fn top_agents(&self, capability_id: &str, limit: usize) -> Vec<(AgentId, f64)> {
        let state = self.state.lock().await;
        let mut ranked: Vec<(AgentId, f64)> = state
            .agents
            .iter()
            .filter_map(|(id, rep)| {
                rep.capabilities
                    .get(capability_id)
                    .map(|m| (id.clone(), m.current_score))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked
    }

    /// Feedback from a human or agent. One vote per `(voter, task)`: repeats are
    /// ignored and a changed vote withdraws the old one first.
    ///
    /// Votes move the decayed up/down tallies but not `total_tasks`. Volume
    /// only grows with recorded outcomes, so a capability with no outcomes
    /// stays at the cold-start score however it is voted on; once outcomes
    /// arrive, the accumulated votes weigh into its success ratio.
    pub async fn submit_vote(&self, vote: Vote) -> VoteOutcome {
        let now = self.clock.now();
        let key = format!("{}:{}", vote.voter_id, vote.task_id);
        let mut state = self.state.lock().await;

        let previous = state.votes.get(&key).cloned();
        if let Some(prev) = &previous {
            if prev.direction == vote.direction
                && prev.agent_id == vote.agent_id
                && prev.capability_id == vote.capability_id
            {
                return VoteOutcome::Unchanged;
            }
        }

        let config = &self.config;
        if let Some(prev) = &previous {
            if let Some(agent) = state.agents.get_mut(&prev.agent_id) {
                match prev.direction {
                    VoteDirection::Up => agent.upvotes = agent.upvotes.saturating_sub(1),
                    VoteDirection::Down => agent.downvotes = agent.downvotes.saturating_sub(1),
                }
                if let Some(metrics) = prev
                    .capability_id
                    .as_deref()
                    .and_then(|c| agent.capabilities.get_mut(c))
                {
                    metrics.apply_vote(prev.direction, -1.0, now, config);
                }
                agent.recompute_global();
            }
        }

        let agent = state
            .agents
            .entry(vote.agent_id.clone())
            .or_insert_with(|| AgentReputation::new(config));
        match vote.direction {
            VoteDirection::Up => agent.upvotes += 1,
            VoteDirection::Down => agent.downvotes += 1,
        }
        if let Some(capability_id) = &vote.capability_id {
            agent
                .capabilities
                .entry(capability_id.clone())
                .or_insert_with(|| CapabilityMetrics::new(now, config))
                .apply_vote(vote.direction, 1.0, now, config);
            agent.recompute_global();
        }

        log::debug!(
            "Vote from {} on task {} for agent {}: {:?}",
            vote.voter_id,
            vote.task_id,
            vote.agent_id,
            vote.direction
        );
        state.votes.insert(key, vote);
        state.dirty = true;

        if previous.is_some() {
            VoteOutcome::Changed
        } else {
            VoteOutcome::Recorded
        }
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    /// Persist the current state if anything changed since the last flush.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.dirty {
            return Ok(());
        }
        save_as(self.store.as_ref(), REPUTATION_KEY, &*state).await?;
        state.dirty = false;
        log::debug!("Flushed reputation for {} agents", state.agents.len());
        Ok(())
    }
}
