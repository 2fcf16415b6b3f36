use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::circuit_breaker::CircuitBreaker;
use crate::config::ExecutionConfig;
use crate::error::FallbackError;
use crate::providers::embedding::EmbeddingProvider;
use crate::registry::AgentRegistry;
use crate::routing::CapabilityRanker;
use crate::types::{Agent, AgentId, CapabilityId, RankedAgent, TaskIntent};

/// Performs the actual call to a specialist.
#[async_trait]
pub trait SpecialistExecutor: Send + Sync {
    async fn call(&self, agent_id: &str, prompt: &str) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackOptions {
    pub max_retries: usize,
    pub timeout_ms: u64,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_ms: 30_000,
        }
    }
}

impl From<&ExecutionConfig> for FallbackOptions {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            timeout_ms: config.fallback_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FallbackAttempt {
    pub agent_id: AgentId,
    pub capability_id: Option<CapabilityId>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FallbackSuccess {
    pub agent_id: AgentId,
    pub capability_id: Option<CapabilityId>,
    pub output: Value,
    pub duration_ms: u64,
}

/// Every attempt made, plus either the winning response or why the chain gave up.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackOutcome {
    pub attempts: Vec<FallbackAttempt>,
    pub result: std::result::Result<FallbackSuccess, FallbackError>,
}

impl FallbackOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct FallbackChain {
    ranker: Arc<CapabilityRanker>,
    breaker: Arc<CircuitBreaker>,
    registry: Arc<dyn AgentRegistry>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl FallbackChain {
    pub fn new(
        ranker: Arc<CapabilityRanker>,
        breaker: Arc<CircuitBreaker>,
        registry: Arc<dyn AgentRegistry>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            ranker,
            breaker,
            registry,
            embedder,
        }
    }

    /// Rank every registered agent for `task_text` and drop excluded or
    /// circuit-blocked ones. Ranker order is kept.
    pub async fn build_fallback_chain(
        &self,
        task_text: &str,
        exclude_agents: &[AgentId],
    ) -> Result<Vec<RankedAgent>> {
        let embedding = self.embedder.embed(task_text).await?;
        let intent = TaskIntent::new(task_text, embedding);
        let candidates = self.registry.list_agents().await?;
        self.build_chain_for_intent(&intent, &candidates, exclude_agents)
            .await
    }

    pub async fn build_chain_for_intent(
        &self,
        intent: &TaskIntent,
        candidates: &[Agent],
        exclude_agents: &[AgentId],
    ) -> Result<Vec<RankedAgent>> {
        let excluded: HashSet<&str> = exclude_agents.iter().map(|s| s.as_str()).collect();
        let ranked = self.ranker.rank(intent, candidates).await?;

        let mut chain = Vec::with_capacity(ranked.len());
        for candidate in ranked {
            if excluded.contains(candidate.agent_id.as_str()) {
                continue;
            }
            if !self.breaker.can_call(&candidate.agent_id).await {
                log::debug!("Circuit open for {}, leaving it out of the chain", candidate.agent_id);
                continue;
            }
            chain.push(candidate);
        }
        Ok(chain)
    }

    /// Try candidates in order until one succeeds. At most `max_retries + 1`
    /// agents are attempted; each attempt races `timeout_ms`.
    pub async fn execute_with_fallback(
        &self,
        chain: &[RankedAgent],
        prompt: &str,
        executor: &dyn SpecialistExecutor,
        options: FallbackOptions,
    ) -> FallbackOutcome {
        let mut attempts = Vec::new();
        let mut last_error: Option<String> = None;
        let timeout = Duration::from_millis(options.timeout_ms);

        for candidate in chain.iter().take(options.max_retries + 1) {
            let agent_id = candidate.agent_id.as_str();
            self.breaker.record_call(agent_id).await;

            let started = Instant::now();
            let outcome = tokio::time::timeout(timeout, executor.call(agent_id, prompt)).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let error = match outcome {
                Ok(Ok(output)) => {
                    self.breaker.record_success(agent_id).await;
                    attempts.push(FallbackAttempt {
                        agent_id: agent_id.to_string(),
                        capability_id: candidate.capability_id.clone(),
                        success: true,
                        error: None,
                        duration_ms,
                    });
                    return FallbackOutcome {
                        attempts,
                        result: Ok(FallbackSuccess {
                            agent_id: agent_id.to_string(),
                            capability_id: candidate.capability_id.clone(),
                            output,
                            duration_ms,
                        }),
                    };
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("Agent {} timed out after {}ms", agent_id, options.timeout_ms),
            };

            log::warn!("Fallback attempt on {} failed: {}", agent_id, error);
            self.breaker.record_failure(agent_id).await;
            attempts.push(FallbackAttempt {
                agent_id: agent_id.to_string(),
                capability_id: candidate.capability_id.clone(),
                success: false,
                error: Some(error.clone()),
                duration_ms,
            });
            last_error = Some(error);
        }

        let result = match last_error {
            Some(last_error) => Err(FallbackError::Exhausted {
                attempts: attempts.len(),
                last_error,
            }),
            None => Err(FallbackError::EmptyChain),
        };
        FallbackOutcome { attempts, result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{CircuitBreakerConfig, PricingConfig, RankingConfig, ReputationConfig};
    use crate::providers::embedding::HashingEmbeddingProvider;
    use crate::registry::InMemoryRegistry;
    use crate::reputation::ReputationEngine;
    use crate::routing::PriceRouter;
    use crate::storage::memory::InMemoryStateStore;
    use crate::types::{CapabilityDescriptor, CircuitState};
    use serde_json::json;
    use tokio::sync::Mutex;

    struct ScriptedExecutor {
        failing: Vec<&'static str>,
        slow: Vec<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn new(failing: Vec<&'static str>, slow: Vec<&'static str>) -> Self {
            Self {
                failing,
                slow,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SpecialistExecutor for ScriptedExecutor {
        async fn call(&self, agent_id: &str, prompt: &str) -> Result<Value> {
            self.calls.lock().await.push(agent_id.to_string());
            if self.slow.contains(&agent_id) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.failing.contains(&agent_id) {
                anyhow::bail!("{} is broken", agent_id);
            }
            Ok(json!({"agent": agent_id, "echo": prompt}))
        }
    }

    fn ranked(ids: &[&str]) -> Vec<RankedAgent> {
        ids.iter()
            .map(|id| RankedAgent {
                agent_id: id.to_string(),
                score: 0.5,
                confidence: 0.9,
                reasoning: String::new(),
                capability_id: Some("sentiment".to_string()),
            })
            .collect()
    }

    fn chain_with(agents: Vec<Agent>, threshold: u32) -> (FallbackChain, Arc<CircuitBreaker>, Arc<CapabilityRanker>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStateStore::new());
        let registry = Arc::new(InMemoryRegistry::with_agents(agents));
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                ..CircuitBreakerConfig::default()
            },
            store.clone(),
            clock.clone(),
        ));
        let reputation = Arc::new(ReputationEngine::new(
            ReputationConfig::default(),
            store.clone(),
            clock.clone(),
        ));
        let prices = Arc::new(PriceRouter::new(
            PricingConfig::default(),
            registry.clone(),
            store,
            clock.clone(),
        ));
        let ranker = Arc::new(CapabilityRanker::new(
            RankingConfig::default(),
            reputation,
            prices,
            clock,
        ));
        let chain = FallbackChain::new(
            ranker.clone(),
            breaker.clone(),
            registry,
            Arc::new(HashingEmbeddingProvider::default()),
        );
        (chain, breaker, ranker)
    }

    #[tokio::test]
    async fn test_first_success_stops_chain() {
        let (chain, breaker, _) = chain_with(vec![], 5);
        let executor = ScriptedExecutor::new(vec!["a"], vec![]);

        let outcome = chain
            .execute_with_fallback(&ranked(&["a", "b", "c"]), "hi", &executor, FallbackOptions::default())
            .await;

        let success = outcome.result.as_ref().unwrap();
        assert_eq!(success.agent_id, "b");
        assert_eq!(success.output["echo"], "hi");
        assert_eq!(*executor.calls.lock().await, vec!["a", "b"]);
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(breaker.get_status("a").await.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_exhausted_chain_reports_last_error() {
        let (chain, _, _) = chain_with(vec![], 5);
        let executor = ScriptedExecutor::new(vec!["a", "b"], vec![]);

        let outcome = chain
            .execute_with_fallback(&ranked(&["a", "b"]), "hi", &executor, FallbackOptions::default())
            .await;

        match outcome.result {
            Err(FallbackError::Exhausted { attempts, last_error }) => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("b is broken"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chain_truncated_to_max_retries() {
        let (chain, _, _) = chain_with(vec![], 5);
        let executor = ScriptedExecutor::new(vec!["a", "b", "c", "d"], vec![]);
        let options = FallbackOptions {
            max_retries: 1,
            timeout_ms: 1_000,
        };

        let outcome = chain
            .execute_with_fallback(&ranked(&["a", "b", "c", "d"]), "hi", &executor, options)
            .await;
        assert!(!outcome.is_success());
        assert_eq!(*executor.calls.lock().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let (chain, breaker, _) = chain_with(vec![], 1);
        let executor = ScriptedExecutor::new(vec![], vec!["slow"]);
        let options = FallbackOptions {
            max_retries: 3,
            timeout_ms: 50,
        };

        let outcome = chain
            .execute_with_fallback(&ranked(&["slow", "fast"]), "hi", &executor, options)
            .await;
        assert_eq!(outcome.result.unwrap().agent_id, "fast");
        assert!(outcome.attempts[0].error.as_ref().unwrap().contains("timed out"));
        assert_eq!(breaker.get_state("slow").await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_empty_chain() {
        let (chain, _, _) = chain_with(vec![], 5);
        let executor = ScriptedExecutor::new(vec![], vec![]);
        let outcome = chain
            .execute_with_fallback(&[], "hi", &executor, FallbackOptions::default())
            .await;
        assert_eq!(outcome.result, Err(FallbackError::EmptyChain));
    }

    #[tokio::test]
    async fn test_build_chain_filters_excluded_and_open_circuits() {
        let cap = CapabilityDescriptor::new("sentiment", "Sentiment analysis", "", "analysis");
        let agents = vec![
            Agent::new("a", vec![cap.clone()]),
            Agent::new("b", vec![cap.clone()]),
            Agent::new("c", vec![cap]),
        ];
        let (chain, breaker, ranker) = chain_with(agents, 1);
        ranker.skip_warm().await;
        let query = HashingEmbeddingProvider::default().embed_sync("sentiment analysis");
        for id in ["a", "b", "c"] {
            ranker.insert_vector(id, "sentiment", query.clone()).await;
        }
        breaker.record_failure("c").await;

        let built = chain
            .build_fallback_chain("sentiment analysis", &["a".to_string()])
            .await
            .unwrap();
        let ids: Vec<&str> = built.iter().map(|r| r.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }
}
