use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::dag::{execute_dag, DagOptions, StepExecutor};
use crate::config::ExecutionConfig;
use crate::planner::Planner;
use crate::reputation::ReputationEngine;
use crate::resilience::{CircuitBreaker, FallbackChain, FallbackOptions, FallbackOutcome, SpecialistExecutor};
use crate::routing::PriceRouter;
use crate::types::{AgentId, BudgetCheckResult, DagPlan, DagResult, PlanResult, PlanStep, StepContext, StepId, TaskId};

#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub text: String,
    /// A ready-made plan. Takes precedence over `multi_step`.
    pub plan: Option<DagPlan>,
    /// Ask the configured planner for a plan instead of routing to one agent.
    pub multi_step: bool,
    pub exclude_agents: Vec<AgentId>,
    pub max_budget: Option<f64>,
}

impl TaskRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            text: text.into(),
            plan: None,
            multi_step: false,
            exclude_agents: Vec::new(),
            max_budget: None,
        }
    }

    pub fn with_plan(mut self, plan: DagPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn multi_step(mut self) -> Self {
        self.multi_step = true;
        self
    }

    pub fn excluding(mut self, agents: Vec<AgentId>) -> Self {
        self.exclude_agents = agents;
        self
    }

    pub fn with_budget(mut self, max_budget: f64) -> Self {
        self.max_budget = Some(max_budget);
        self
    }
}

#[derive(Debug, Clone)]
pub enum TaskOutcome {
    SingleStep(FallbackOutcome),
    MultiStep(DagResult),
    /// The plan was never started because its estimate exceeds the budget.
    OverBudget(BudgetCheckResult),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        match self {
            TaskOutcome::SingleStep(outcome) => outcome.is_success(),
            TaskOutcome::MultiStep(result) => result.success,
            TaskOutcome::OverBudget(_) => false,
        }
    }
}

/// Picks single-agent or multi-step execution for a task and feeds every
/// outcome back into the circuit breaker and reputation engine.
pub struct Orchestrator {
    breaker: Arc<CircuitBreaker>,
    reputation: Arc<ReputationEngine>,
    prices: Arc<PriceRouter>,
    fallback: Arc<FallbackChain>,
    specialists: Arc<dyn SpecialistExecutor>,
    steps: Arc<dyn StepExecutor>,
    planner: Option<Arc<dyn Planner>>,
    config: ExecutionConfig,
}

impl Orchestrator {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        reputation: Arc<ReputationEngine>,
        prices: Arc<PriceRouter>,
        fallback: Arc<FallbackChain>,
        specialists: Arc<dyn SpecialistExecutor>,
        steps: Arc<dyn StepExecutor>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            breaker,
            reputation,
            prices,
            fallback,
            specialists,
            steps,
            planner: None,
            config,
        }
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn reputation(&self) -> &Arc<ReputationEngine> {
        &self.reputation
    }

    pub fn prices(&self) -> &Arc<PriceRouter> {
        &self.prices
    }

    pub async fn execute_task(&self, request: TaskRequest) -> Result<TaskOutcome> {
        log::info!("Executing task {}", request.task_id);

        let plan = match (&request.plan, &self.planner) {
            (Some(plan), _) => Some(plan.clone()),
            (None, Some(planner)) if request.multi_step => Some(planner.plan_dag(&request.text).await?),
            (None, None) if request.multi_step => {
                anyhow::bail!("Multi-step execution requested but no planner is configured")
            }
            _ => None,
        };

        let outcome = match plan {
            Some(plan) => self.run_plan(&plan, request.max_budget).await?,
            None => TaskOutcome::SingleStep(self.run_single(&request).await?),
        };

        self.flush().await;
        Ok(outcome)
    }

    async fn run_plan(&self, plan: &DagPlan, max_budget: Option<f64>) -> Result<TaskOutcome> {
        if let Some(max_budget) = max_budget {
            let budget = self.prices.check_budget(plan, max_budget);
            if !budget.within_budget {
                log::warn!(
                    "Plan estimate {:.4} exceeds budget {:.4}",
                    budget.total_cost,
                    budget.max_budget
                );
                return Ok(TaskOutcome::OverBudget(budget));
            }
        }

        let tracked = TrackedStepExecutor {
            breaker: self.breaker.clone(),
            reputation: self.reputation.clone(),
            inner: self.steps.clone(),
            gated: Mutex::new(HashSet::new()),
        };
        let result = execute_dag(plan, &tracked, DagOptions::from(&self.config)).await?;

        Ok(TaskOutcome::MultiStep(result))
    }

    async fn run_single(&self, request: &TaskRequest) -> Result<FallbackOutcome> {
        let chain = self
            .fallback
            .build_fallback_chain(&request.text, &request.exclude_agents)
            .await?;
        log::debug!("Fallback chain for {}: {} candidates", request.task_id, chain.len());

        let outcome = self
            .fallback
            .execute_with_fallback(
                &chain,
                &request.text,
                self.specialists.as_ref(),
                FallbackOptions::from(&self.config),
            )
            .await;

        // The chain already updated the breaker; reputation is ours to feed.
        for attempt in &outcome.attempts {
            let capability = attempt.capability_id.as_deref();
            if attempt.success {
                self.reputation.record_success(&attempt.agent_id, capability).await;
            } else {
                self.reputation.record_failure(&attempt.agent_id, capability).await;
            }
            if let Some(capability) = capability {
                self.reputation
                    .record_latency(&attempt.agent_id, capability, attempt.duration_ms)
                    .await;
            }
        }

        Ok(outcome)
    }

    /// Persist stats accumulated during the task.
    pub async fn flush(&self) {
        if let Err(e) = self.reputation.flush().await {
            log::warn!("Failed to persist reputation state: {}", e);
        }
        if let Err(e) = self.prices.flush().await {
            log::warn!("Failed to persist price cache: {}", e);
        }
    }
}

/// Gates each step on its specialist's circuit before delegating, and feeds
/// each round's outcomes back before the next round is gated.
struct TrackedStepExecutor {
    breaker: Arc<CircuitBreaker>,
    reputation: Arc<ReputationEngine>,
    inner: Arc<dyn StepExecutor>,
    gated: Mutex<HashSet<StepId>>,
}

impl TrackedStepExecutor {
    async fn record_outcome(&self, step: &PlanStep, result: &PlanResult) {
        let agent_id = step.specialist.as_str();
        let capability = step.capability.as_deref();
        if result.success {
            self.breaker.record_success(agent_id).await;
            self.reputation.record_success(agent_id, capability).await;
        } else {
            self.breaker.record_failure(agent_id).await;
            self.reputation.record_failure(agent_id, capability).await;
        }
        if let Some(capability) = capability {
            self.reputation
                .record_latency(agent_id, capability, result.duration_ms)
                .await;
        }
    }
}

#[async_trait]
impl StepExecutor for TrackedStepExecutor {
    async fn execute(&self, step: &PlanStep, context: &StepContext) -> Result<PlanResult> {
        if !self.breaker.try_acquire(&step.specialist).await {
            self.gated.lock().await.insert(step.id.clone());
            return Ok(PlanResult::failed(
                step,
                format!("Circuit open for agent '{}'", step.specialist),
            ));
        }
        self.inner.execute(step, context).await
    }

    async fn round_finished(&self, completed: &[(&PlanStep, &PlanResult)]) {
        let gated = self.gated.lock().await.clone();
        for (step, result) in completed {
            if gated.contains(&step.id) {
                continue;
            }
            self.record_outcome(step, result).await;
        }
    }
}
