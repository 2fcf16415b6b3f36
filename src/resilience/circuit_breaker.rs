use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;
use crate::storage::traits::{load_as, save_as, StateStore, CIRCUIT_BREAKER_KEY};
use crate::types::{AgentId, CircuitState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub half_open_attempts: u32,
}

impl Default for CircuitBreakerStatus {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_time: None,
            half_open_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CircuitEvent {
    CooldownElapsed,
    Success,
    Failure,
}

/// Per-agent failure gate. Every mutation is written through to the state store
/// before the call returns.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    statuses: Mutex<HashMap<AgentId, CircuitBreakerStatus>>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(
        config: CircuitBreakerConfig,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            statuses: Mutex::new(HashMap::new()),
            store,
            clock,
        }
    }

    /// Build a breaker and restore whatever statuses were persisted previously.
    pub async fn load(
        config: CircuitBreakerConfig,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let restored: HashMap<AgentId, CircuitBreakerStatus> =
            load_as(store.as_ref(), CIRCUIT_BREAKER_KEY)
                .await?
                .unwrap_or_default();
        log::debug!("Restored {} circuit breaker statuses", restored.len());

        let breaker = Self::new(config, store, clock);
        *breaker.statuses.lock().await = restored;
        Ok(breaker)
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub async fn can_call(&self, agent_id: &str) -> bool {
        let mut statuses = self.statuses.lock().await;
        let status = statuses.entry(agent_id.to_string()).or_default();
        let (allowed, changed) = self.admit(agent_id, status);
        if changed {
            self.persist(&statuses).await;
        }
        allowed
    }

    /// `can_call` and `record_call` as one step under a single lock, so
    /// concurrent callers cannot overdraw the half-open attempt budget.
    pub async fn try_acquire(&self, agent_id: &str) -> bool {
        let mut statuses = self.statuses.lock().await;
        let status = statuses.entry(agent_id.to_string()).or_default();
        let (allowed, mut changed) = self.admit(agent_id, status);
        if allowed && status.state == CircuitState::HalfOpen {
            status.half_open_attempts += 1;
            changed = true;
        }
        if changed {
            self.persist(&statuses).await;
        }
        allowed
    }

    /// Whether a call may go through, and whether `status` changed deciding it.
    fn admit(&self, agent_id: &str, status: &mut CircuitBreakerStatus) -> (bool, bool) {
        match status.state {
            CircuitState::Closed => (true, false),
            CircuitState::Open => {
                let cooldown = Duration::milliseconds(self.config.cooldown_ms as i64);
                let elapsed = status
                    .last_failure_time
                    .map(|t| self.clock.now() - t > cooldown)
                    .unwrap_or(true);
                if !elapsed {
                    return (false, false);
                }
                Self::transition(agent_id, status, CircuitEvent::CooldownElapsed, &self.config);
                (true, true)
            }
            CircuitState::HalfOpen => {
                (status.half_open_attempts < self.config.half_open_max_attempts, false)
            }
        }
    }

    /// Consume one attempt from the half-open budget. No-op in other states.
    pub async fn record_call(&self, agent_id: &str) {
        let mut statuses = self.statuses.lock().await;
        let status = statuses.entry(agent_id.to_string()).or_default();
        if status.state == CircuitState::HalfOpen {
            status.half_open_attempts += 1;
            self.persist(&statuses).await;
        }
    }

    pub async fn record_success(&self, agent_id: &str) {
        let mut statuses = self.statuses.lock().await;
        let status = statuses.entry(agent_id.to_string()).or_default();
        Self::transition(agent_id, status, CircuitEvent::Success, &self.config);
        self.persist(&statuses).await;
    }

    pub async fn record_failure(&self, agent_id: &str) {
        let now = self.clock.now();
        let mut statuses = self.statuses.lock().await;
        let status = statuses.entry(agent_id.to_string()).or_default();
        status.last_failure_time = Some(now);
        Self::transition(agent_id, status, CircuitEvent::Failure, &self.config);
        self.persist(&statuses).await;
    }

    pub async fn get_state(&self, agent_id: &str) -> CircuitState {
        self.get_status(agent_id).await.state
    }

    pub async fn get_status(&self, agent_id: &str) -> CircuitBreakerStatus {
        self.statuses
            .lock()
            .await
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn snapshot(&self) -> HashMap<AgentId, CircuitBreakerStatus> {
        self.statuses.lock().await.clone()
    }

    /// Force an agent back to a fresh CLOSED status (operator override).
    pub async fn reset(&self, agent_id: &str) {
        let mut statuses = self.statuses.lock().await;
        statuses.insert(agent_id.to_string(), CircuitBreakerStatus::default());
        self.persist(&statuses).await;
    }

    fn transition(
        agent_id: &str,
        status: &mut CircuitBreakerStatus,
        event: CircuitEvent,
        config: &CircuitBreakerConfig,
    ) {
        let previous = status.state;
        match (status.state, event) {
            (CircuitState::Open, CircuitEvent::CooldownElapsed) => {
                status.state = CircuitState::HalfOpen;
                status.half_open_attempts = 0;
            }
            (_, CircuitEvent::Success) => {
                status.state = CircuitState::Closed;
                status.consecutive_failures = 0;
                status.half_open_attempts = 0;
                status.last_failure_time = None;
            }
            // A failed trial call re-opens immediately; the failure count carries over.
            (CircuitState::HalfOpen, CircuitEvent::Failure) => {
                status.state = CircuitState::Open;
            }
            (_, CircuitEvent::Failure) => {
                status.consecutive_failures += 1;
                if status.consecutive_failures >= config.failure_threshold {
                    status.state = CircuitState::Open;
                }
            }
            (_, CircuitEvent::CooldownElapsed) => {}
        }

        if previous != status.state {
            match status.state {
                CircuitState::Open => log::warn!(
                    "Circuit for agent {} opened after {} consecutive failures",
                    agent_id,
                    status.consecutive_failures
                ),
                state => log::info!(
                    "Circuit for agent {} moved {} -> {}",
                    agent_id,
                    previous.as_str(),
                    state.as_str()
                ),
            }
        }
    }

    async fn persist(&self, statuses: &HashMap<AgentId, CircuitBreakerStatus>) {
        if let Err(e) = save_as(self.store.as_ref(), CIRCUIT_BREAKER_KEY, statuses).await {
            log::error!("Failed to persist circuit breaker state: {}", e);
        }
    }
}
