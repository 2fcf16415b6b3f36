use anyhow::Result;
use chrono::Duration;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

use super::index::CapabilityIndex;
use super::price::PriceRouter;
use crate::clock::Clock;
use crate::config::RankingConfig;
use crate::error::RankerError;
use crate::providers::embedding::EmbeddingProvider;
use crate::reputation::ReputationEngine;
use crate::types::{Agent, RankedAgent, TaskIntent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Cold,
    Warm,
}

/// Ranks candidate agents for an intent by semantic match, reputation, price
/// efficiency and health.
///
/// Construction is cheap and leaves the ranker cold; `warm` (or an explicit
/// `skip_warm`) must run before `rank` is used.
pub struct CapabilityRanker {
    config: RankingConfig,
    index: RwLock<CapabilityIndex>,
    readiness: RwLock<Readiness>,
    reputation: Arc<ReputationEngine>,
    prices: Arc<PriceRouter>,
    clock: Arc<dyn Clock>,
}

impl CapabilityRanker {
    pub fn new(
        config: RankingConfig,
        reputation: Arc<ReputationEngine>,
        prices: Arc<PriceRouter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            index: RwLock::new(CapabilityIndex::new()),
            readiness: RwLock::new(Readiness::Cold),
            reputation,
            prices,
            clock,
        }
    }

    pub async fn is_ready(&self) -> bool {
        *self.readiness.read().await == Readiness::Warm
    }

    /// Embed every capability in `agents` that has no vector yet. Stops early,
    /// leaving the ranker cold, if `cancel` flips to `true`.
    pub async fn warm(
        &self,
        agents: &[Agent],
        embedder: &dyn EmbeddingProvider,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<usize> {
        let mut indexed = 0;
        for agent in agents {
            if *cancel.borrow() {
                log::warn!("Ranker warm-up cancelled after {} capabilities", indexed);
                return Err(RankerError::Cancelled.into());
            }

            let pending: Vec<_> = {
                let index = self.index.read().await;
                agent
                    .capabilities
                    .iter()
                    .filter(|c| !index.contains(&agent.id, &c.id))
                    .cloned()
                    .collect()
            };
            if pending.is_empty() {
                continue;
            }

            let texts: Vec<String> = pending.iter().map(|c| c.embedding_text()).collect();
            let vectors = tokio::select! {
                vectors = embedder.embed_batch(&texts) => vectors?,
                Ok(_) = cancel.wait_for(|cancelled| *cancelled) => {
                    log::warn!("Ranker warm-up cancelled while embedding agent {}", agent.id);
                    return Err(RankerError::Cancelled.into());
                }
            };

            let mut index = self.index.write().await;
            for (capability, vector) in pending.iter().zip(vectors) {
                index.insert(&agent.id, &capability.id, vector);
                indexed += 1;
            }
        }

        *self.readiness.write().await = Readiness::Warm;
        log::info!(
            "Capability ranker warmed with {} new embeddings ({} indexed)",
            indexed,
            self.index.read().await.len()
        );
        Ok(indexed)
    }

    /// Mark the ranker ready without backfilling embeddings.
    pub async fn skip_warm(&self) {
        *self.readiness.write().await = Readiness::Warm;
    }

    pub async fn insert_vector(&self, agent_id: &str, capability_id: &str, vector: Vec<f32>) {
        self.index.write().await.insert(agent_id, capability_id, vector);
    }

    /// Score and sort `candidates` for `intent`, best first. Agents without
    /// stored vectors, or whose best similarity is under the threshold, are left out.
    pub async fn rank(&self, intent: &TaskIntent, candidates: &[Agent]) -> Result<Vec<RankedAgent>> {
        if !self.is_ready().await {
            return Err(RankerError::NotReady.into());
        }

        let mut ranked = Vec::new();
        for agent in candidates {
            let best = self.index.read().await.best_match(&agent.id, &intent.embedding);
            let Some((capability_id, similarity)) = best else {
                log::debug!("Agent {} has no capability vectors, skipping", agent.id);
                continue;
            };
            if similarity < self.config.similarity_threshold {
                continue;
            }
            let similarity = similarity as f64;

            let price = agent
                .price_for(&capability_id)
                .unwrap_or_else(|| self.prices.default_price());
            let market = self.prices.get_market_data(&capability_id).await?;
            let price_efficiency = self.prices.calculate_price_efficiency(price, market.average);

            let mut reputation = self
                .reputation
                .get_reputation_score(&agent.id, Some(&capability_id))
                .await;
            let slow = self
                .reputation
                .get_capability_metrics(&agent.id, &capability_id)
                .await
                .map(|m| m.is_slow(self.config.slow_latency_ms))
                .unwrap_or(false);
            if slow {
                reputation *= 0.5;
            }

            let healthy = self.is_healthy(agent);
            let health_penalty = if healthy { 1.0 } else { 0.0 };

            let score = ((similarity * self.config.similarity_weight
                + reputation * self.config.reputation_weight
                + price_efficiency * self.config.price_weight)
                * health_penalty)
                .clamp(0.0, 1.0);

            let mut reasoning = format!(
                "matched '{}' (similarity {:.2}), reputation {:.2}, price efficiency {:.2}",
                capability_id, similarity, reputation, price_efficiency
            );
            if slow {
                reasoning.push_str(", slow p50 latency");
            }
            if !healthy {
                reasoning.push_str(", unhealthy");
            }

            ranked.push(RankedAgent {
                agent_id: agent.id.clone(),
                score,
                confidence: similarity.clamp(0.0, 1.0),
                reasoning,
                capability_id: Some(capability_id),
            });
        }

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        Ok(ranked)
    }

    /// Healthy, active, and (when a check was recorded) checked recently enough.
    fn is_healthy(&self, agent: &Agent) -> bool {
        if !agent.healthy || !agent.active {
            return false;
        }
        match agent.last_health_check {
            Some(checked_at) => {
                let staleness = Duration::seconds(self.config.health_staleness_secs);
                self.clock.now() - checked_at <= staleness
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{PricingConfig, ReputationConfig};
    use crate::providers::embedding::HashingEmbeddingProvider;
    use crate::registry::InMemoryRegistry;
    use crate::storage::memory::InMemoryStateStore;
    use crate::types::CapabilityDescriptor;

    struct Fixture {
        ranker: CapabilityRanker,
        reputation: Arc<ReputationEngine>,
        clock: Arc<ManualClock>,
    }

    fn fixture(agents: &[Agent]) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStateStore::new());
        let registry = Arc::new(InMemoryRegistry::with_agents(agents.to_vec()));
        let reputation = Arc::new(ReputationEngine::new(
            ReputationConfig::default(),
            store.clone(),
            clock.clone(),
        ));
        let prices = Arc::new(PriceRouter::new(
            PricingConfig::default(),
            registry,
            store,
            clock.clone(),
        ));
        let ranker = CapabilityRanker::new(
            RankingConfig::default(),
            reputation.clone(),
            prices,
            clock.clone(),
        );
        Fixture {
            ranker,
            reputation,
            clock,
        }
    }

    fn agent(id: &str, price: f64) -> Agent {
        Agent::new(
            id,
            vec![CapabilityDescriptor::new("sentiment", "Sentiment", "", "analysis")],
        )
        .with_price("sentiment", price)
    }

    fn intent() -> TaskIntent {
        TaskIntent::new("how do people feel", vec![1.0, 0.0, 0.0])
    }

    #[tokio::test]
    async fn test_cold_ranker_refuses() {
        let f = fixture(&[]);
        let err = f.ranker.rank(&intent(), &[]).await.unwrap_err();
        assert!(err.to_string().contains("not been warmed"));
    }

    #[tokio::test]
    async fn test_score_formula() {
        let a = agent("a", 0.01);
        let f = fixture(&[a.clone()]);
        f.ranker.skip_warm().await;
        f.ranker.insert_vector("a", "sentiment", vec![1.0, 0.0, 0.0]).await;

        let ranked = f.ranker.rank(&intent(), &[a]).await.unwrap();
        assert_eq!(ranked.len(), 1);
        // similarity 1.0, cold-start reputation 0.5, priced at market -> 0.5
        let expected = 1.0 * 0.4 + 0.5 * 0.3 + 0.5 * 0.3;
        assert!((ranked[0].score - expected).abs() < 1e-6);
        assert_eq!(ranked[0].capability_id.as_deref(), Some("sentiment"));
    }

    #[tokio::test]
    async fn test_below_threshold_and_unindexed_are_dropped() {
        let a = agent("a", 0.01);
        let b = agent("b", 0.01);
        let f = fixture(&[a.clone(), b.clone()]);
        f.ranker.skip_warm().await;
        f.ranker.insert_vector("a", "sentiment", vec![0.0, 1.0, 0.0]).await;

        let ranked = f.ranker.rank(&intent(), &[a, b]).await.unwrap();
        assert!(ranked.is_empty());
    }

    #[tokio::test]
    async fn test_stale_health_check_zeroes_score() {
        let f = fixture(&[]);
        let fresh = agent("fresh", 0.01).with_health_check(true, f.clock.now());
        let stale = agent("stale", 0.01)
            .with_health_check(true, f.clock.now() - Duration::seconds(301));
        let mut down = agent("down", 0.01);
        down.healthy = false;

        f.ranker.skip_warm().await;
        for id in ["fresh", "stale", "down"] {
            f.ranker.insert_vector(id, "sentiment", vec![1.0, 0.0, 0.0]).await;
        }

        let ranked = f.ranker.rank(&intent(), &[stale, down, fresh]).await.unwrap();
        assert_eq!(ranked[0].agent_id, "fresh");
        assert!(ranked[0].score > 0.0);
        assert_eq!(ranked[1].score, 0.0);
        assert_eq!(ranked[2].score, 0.0);
        assert!(ranked[1].reasoning.contains("unhealthy"));
    }

    #[tokio::test]
    async fn test_slow_agent_reputation_halved() {
        let fast = agent("fast", 0.01);
        let slow = agent("slow", 0.01);
        let f = fixture(&[fast.clone(), slow.clone()]);
        for _ in 0..20 {
            f.reputation.record_success("fast", Some("sentiment")).await;
            f.reputation.record_success("slow", Some("sentiment")).await;
        }
        f.reputation.record_latency("slow", "sentiment", 40_000).await;
        f.reputation.record_latency("fast", "sentiment", 40_000).await;
        f.reputation.record_latency("fast", "sentiment", 100).await;
        f.reputation.record_latency("fast", "sentiment", 100).await;

        f.ranker.skip_warm().await;
        f.ranker.insert_vector("fast", "sentiment", vec![1.0, 0.0, 0.0]).await;
        f.ranker.insert_vector("slow", "sentiment", vec![1.0, 0.0, 0.0]).await;

        let ranked = f.ranker.rank(&intent(), &[slow, fast]).await.unwrap();
        assert_eq!(ranked[0].agent_id, "fast");
        assert!(ranked[1].reasoning.contains("slow"));
        // slow: reputation 0.7 halved to 0.35
        let expected_slow = 0.4 + 0.35 * 0.3 + 0.5 * 0.3;
        assert!((ranked[1].score - expected_slow).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_cheaper_agent_ranks_higher() {
        let cheap = agent("cheap", 0.005);
        let pricey = agent("pricey", 0.04);
        let f = fixture(&[cheap.clone(), pricey.clone()]);
        f.ranker.skip_warm().await;
        f.ranker.insert_vector("cheap", "sentiment", vec![1.0, 0.0, 0.0]).await;
        f.ranker.insert_vector("pricey", "sentiment", vec![1.0, 0.0, 0.0]).await;

        let ranked = f.ranker.rank(&intent(), &[pricey, cheap]).await.unwrap();
        assert_eq!(ranked[0].agent_id, "cheap");
        assert!(ranked[0].score > ranked[1].score);
    }

    #[tokio::test]
    async fn test_warm_backfills_and_marks_ready() {
        let a = agent("a", 0.01);
        let f = fixture(&[a.clone()]);
        let (_tx, mut rx) = watch::channel(false);

        let embedder = HashingEmbeddingProvider::new(64);
        let indexed = f.ranker.warm(&[a.clone()], &embedder, &mut rx).await.unwrap();
        assert_eq!(indexed, 1);
        assert!(f.ranker.is_ready().await);

        // already-indexed capabilities are not embedded again
        let indexed = f.ranker.warm(&[a], &embedder, &mut rx).await.unwrap();
        assert_eq!(indexed, 0);
    }

    #[tokio::test]
    async fn test_warm_cancelled_stays_cold() {
        let a = agent("a", 0.01);
        let f = fixture(&[a.clone()]);
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();

        let embedder = HashingEmbeddingProvider::new(64);
        assert!(f.ranker.warm(&[a], &embedder, &mut rx).await.is_err());
        assert!(!f.ranker.is_ready().await);
    }
}
