use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::validate::validate_plan;
use crate::config::ExecutionConfig;
use crate::error::{PlanError, StepError};
use crate::types::{DagPlan, DagResult, PlanResult, PlanStep, StepContext, StepId};

/// Runs a single plan step against whatever agent it names.
///
/// Returning `Err` or a result with `success == false` both mark the step
/// failed; the difference only shows in the recorded summary.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: &PlanStep, context: &StepContext) -> Result<PlanResult>;

    /// Called once per round, after every step in it has finished or timed
    /// out and before the next round is scheduled.
    async fn round_finished(&self, _completed: &[(&PlanStep, &PlanResult)]) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DagOptions {
    /// Applies to steps that do not carry their own `timeout_ms`.
    pub timeout_ms: u64,
}

impl Default for DagOptions {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl From<&ExecutionConfig> for DagOptions {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            timeout_ms: config.step_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Succeeded,
    Failed,
    Skipped,
}

/// Execute `plan` in rounds.
///
/// Each round launches every step whose dependencies all succeeded and waits
/// for the whole round before computing the next one. Steps downstream of a
/// failure are skipped without running. Step failures and timeouts are
/// reported in the returned `DagResult`; only a structurally invalid plan
/// produces an `Err`.
pub async fn execute_dag(
    plan: &DagPlan,
    executor: &dyn StepExecutor,
    options: DagOptions,
) -> Result<DagResult, PlanError> {
    validate_plan(plan)?;

    let started = Instant::now();
    let mut resolved: HashMap<StepId, Resolution> = HashMap::with_capacity(plan.steps.len());
    let mut context = StepContext::new();
    let mut results: Vec<PlanResult> = Vec::with_capacity(plan.steps.len());
    let mut round = 0usize;

    while resolved.len() < plan.steps.len() {
        round += 1;
        let resolved_before = resolved.len();
        let mut ready: Vec<&PlanStep> = Vec::new();

        let pending: Vec<&PlanStep> = plan
            .steps
            .iter()
            .filter(|s| !resolved.contains_key(&s.id))
            .collect();

        for step in pending {
            let blocked: Vec<&str> = step
                .dependencies
                .iter()
                .filter(|d| {
                    matches!(
                        resolved.get(d.as_str()),
                        Some(Resolution::Failed) | Some(Resolution::Skipped)
                    )
                })
                .map(|d| d.as_str())
                .collect();

            if !blocked.is_empty() {
                let summary = format!("Skipped due to dependency failure: {}", blocked.join(", "));
                log::warn!("Step '{}' skipped: {}", step.id, summary);
                resolved.insert(step.id.clone(), Resolution::Skipped);
                results.push(PlanResult::skipped(step, summary));
                continue;
            }

            let all_done = step
                .dependencies
                .iter()
                .all(|d| resolved.get(d.as_str()) == Some(&Resolution::Succeeded));
            if all_done {
                ready.push(step);
            }
        }

        if ready.is_empty() {
            // Skips alone still count as progress.
            if resolved.len() == resolved_before {
                let steps: Vec<StepId> = plan
                    .steps
                    .iter()
                    .filter(|s| !resolved.contains_key(&s.id))
                    .map(|s| s.id.clone())
                    .collect();
                return Err(PlanError::Cycle { steps });
            }
            continue;
        }

        log::debug!(
            "DAG round {}: running {}",
            round,
            ready.iter().map(|s| s.id.as_str()).collect::<Vec<_>>().join(", ")
        );

        let snapshot = &context;
        let outcomes = join_all(
            ready
                .iter()
                .map(|step| run_step(step, snapshot, executor, options.timeout_ms)),
        )
        .await;

        let completed: Vec<(&PlanStep, &PlanResult)> =
            ready.iter().copied().zip(outcomes.iter()).collect();
        executor.round_finished(&completed).await;

        for (step, result) in ready.into_iter().zip(outcomes) {
            let resolution = if result.success {
                context.insert(step.id.clone(), result.output.clone());
                Resolution::Succeeded
            } else {
                Resolution::Failed
            };
            resolved.insert(step.id.clone(), resolution);
            results.push(result);
        }
    }

    let success = results.iter().all(|r| r.success && !r.skipped);
    let total_cost = results.iter().filter(|r| r.success).map(|r| r.cost).sum();

    Ok(DagResult {
        success,
        results,
        total_cost,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

async fn run_step(
    step: &PlanStep,
    context: &StepContext,
    executor: &dyn StepExecutor,
    default_timeout_ms: u64,
) -> PlanResult {
    let timeout_ms = step.timeout_ms.unwrap_or(default_timeout_ms);
    let started = Instant::now();

    let outcome =
        tokio::time::timeout(Duration::from_millis(timeout_ms), executor.execute(step, context)).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let mut result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            let err = StepError::Execution {
                step: step.id.clone(),
                message: e.to_string(),
            };
            log::warn!("{}", err);
            PlanResult::failed(step, err.to_string())
        }
        Err(_) => {
            let err = StepError::Timeout {
                step: step.id.clone(),
                timeout_ms,
            };
            log::warn!("{}", err);
            PlanResult::failed(step, err.to_string())
        }
    };
    result.step_id = step.id.clone();
    result.duration_ms = duration_ms;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::template::resolve_template;
    use serde_json::json;
    use std::collections::HashSet;
    use tokio::sync::Mutex;
    use tokio::time::Instant as TokioInstant;

    #[derive(Debug, Clone)]
    struct Span {
        step: String,
        start: TokioInstant,
        end: TokioInstant,
    }

    #[derive(Default)]
    struct ScriptedExecutor {
        delays_ms: HashMap<String, u64>,
        failing: HashSet<String>,
        spans: Mutex<Vec<Span>>,
        prompts: Mutex<HashMap<String, String>>,
    }

    impl ScriptedExecutor {
        fn delay(mut self, step: &str, ms: u64) -> Self {
            self.delays_ms.insert(step.to_string(), ms);
            self
        }

        fn fail(mut self, step: &str) -> Self {
            self.failing.insert(step.to_string());
            self
        }

        async fn span(&self, step: &str) -> Span {
            self.spans
                .lock()
                .await
                .iter()
                .find(|s| s.step == step)
                .cloned()
                .unwrap()
        }
    }

    #[async_trait]
    impl StepExecutor for ScriptedExecutor {
        async fn execute(&self, step: &PlanStep, context: &StepContext) -> Result<PlanResult> {
            let start = TokioInstant::now();
            let prompt = resolve_template(&step.prompt_template, context);
            self.prompts.lock().await.insert(step.id.clone(), prompt);

            if let Some(ms) = self.delays_ms.get(&step.id) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            self.spans.lock().await.push(Span {
                step: step.id.clone(),
                start,
                end: TokioInstant::now(),
            });

            if self.failing.contains(&step.id) {
                anyhow::bail!("specialist returned 500");
            }
            Ok(PlanResult::succeeded(
                step,
                json!({"summary": format!("{} done", step.id)}),
                "ok",
            ))
        }
    }

    fn step(id: &str, deps: &[&str]) -> PlanStep {
        PlanStep::new(id, format!("agent-{}", id), format!("do {}", id)).depends_on(deps)
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_chain_runs_in_order() {
        let plan = DagPlan::new(vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])]);
        let executor = ScriptedExecutor::default()
            .delay("a", 100)
            .delay("b", 100)
            .delay("c", 100);

        let result = execute_dag(&plan, &executor, DagOptions::default()).await.unwrap();

        assert!(result.success);
        let order: Vec<&str> = result.results.iter().map(|r| r.step_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(executor.span("b").await.start >= executor.span("a").await.end);
        assert!(executor.span("c").await.start >= executor.span("b").await.end);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_steps_start_together() {
        let plan = DagPlan::new(vec![step("a", &[]), step("b", &[]), step("c", &["a", "b"])]);
        let executor = ScriptedExecutor::default()
            .delay("a", 200)
            .delay("b", 50);

        let result = execute_dag(&plan, &executor, DagOptions::default()).await.unwrap();
        assert!(result.success);

        let a = executor.span("a").await;
        let b = executor.span("b").await;
        let c = executor.span("c").await;
        let skew = if a.start > b.start { a.start - b.start } else { b.start - a.start };
        assert!(skew < Duration::from_millis(10));
        assert!(c.start >= a.end && c.start >= b.end);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_barrier_holds_fast_dependents() {
        // c only needs a, but a shares its round with the slow b.
        let plan = DagPlan::new(vec![step("a", &[]), step("b", &[]), step("c", &["a"])]);
        let executor = ScriptedExecutor::default().delay("b", 500);

        execute_dag(&plan, &executor, DagOptions::default()).await.unwrap();

        assert!(executor.span("c").await.start >= executor.span("b").await.end);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let plan = DagPlan::new(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("d", &["a"]),
        ]);
        let executor = ScriptedExecutor::default().fail("b");

        let result = execute_dag(&plan, &executor, DagOptions::default()).await.unwrap();

        assert!(!result.success);
        assert!(result.is_partial_failure());
        assert!(result.result_for("a").unwrap().success);
        assert!(result.result_for("d").unwrap().success);

        let b = result.result_for("b").unwrap();
        assert!(!b.success && !b.skipped);
        assert!(b.summary.contains("specialist returned 500"));

        let c = result.result_for("c").unwrap();
        assert!(c.skipped && !c.success);
        assert!(c.summary.starts_with("Skipped due to dependency failure"));
        assert!(c.summary.contains('b'));

        let ran: Vec<String> = executor.spans.lock().await.iter().map(|s| s.step.clone()).collect();
        assert!(!ran.contains(&"c".to_string()));
    }

    #[tokio::test]
    async fn test_skips_cascade() {
        let plan = DagPlan::new(vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])]);
        let executor = ScriptedExecutor::default().fail("a");

        let result = execute_dag(&plan, &executor, DagOptions::default()).await.unwrap();
        assert_eq!(result.skipped().count(), 2);
        assert!(result.result_for("c").unwrap().summary.contains('b'));
    }

    #[tokio::test]
    async fn test_two_cycle_is_rejected() {
        let plan = DagPlan::new(vec![step("a", &["b"]), step("b", &["a"])]);
        let executor = ScriptedExecutor::default();

        let err = execute_dag(&plan, &executor, DagOptions::default()).await.unwrap_err();
        assert!(err.to_string().contains("Cycle detected"));
        assert!(executor.spans.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_dangling_dependency_is_rejected() {
        let plan = DagPlan::new(vec![step("a", &["missing"])]);
        let err = execute_dag(&plan, &ScriptedExecutor::default(), DagOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_marks_step_failed() {
        let plan = DagPlan::new(vec![step("slow", &[]), step("after", &["slow"])]);
        let executor = ScriptedExecutor::default().delay("slow", 10_000);

        let result = execute_dag(&plan, &executor, DagOptions { timeout_ms: 100 })
            .await
            .unwrap();

        assert!(!result.success);
        let slow = result.result_for("slow").unwrap();
        assert!(!slow.success);
        assert!(slow.summary.contains("timed out"));
        assert!(result.result_for("after").unwrap().skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_overrides_default() {
        let plan = DagPlan::new(vec![step("a", &[]).with_timeout_ms(50)]);
        let executor = ScriptedExecutor::default().delay("a", 200);

        let result = execute_dag(&plan, &executor, DagOptions { timeout_ms: 1_000 })
            .await
            .unwrap();
        assert!(result.result_for("a").unwrap().summary.contains("50ms"));
    }

    #[tokio::test]
    async fn test_empty_plan_succeeds() {
        let result = execute_dag(&DagPlan::new(vec![]), &ScriptedExecutor::default(), DagOptions::default())
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.results.is_empty());
        assert_eq!(result.total_cost, 0.0);
    }

    #[tokio::test]
    async fn test_context_carries_completed_outputs() {
        let plan = DagPlan::new(vec![
            step("research", &[]),
            PlanStep::new("write", "writer", "Based on {{research.summary}}, write").depends_on(&["research"]),
        ]);
        let executor = ScriptedExecutor::default();

        execute_dag(&plan, &executor, DagOptions::default()).await.unwrap();

        let prompts = executor.prompts.lock().await;
        assert_eq!(prompts["write"], "Based on research done, write");
    }

    #[tokio::test]
    async fn test_total_cost_counts_successful_steps() {
        let plan = DagPlan::new(vec![
            step("a", &[]).with_cost(1.5),
            step("b", &[]).with_cost(2.0),
            step("c", &[]).with_cost(4.0),
        ]);
        let executor = ScriptedExecutor::default().fail("c");

        let result = execute_dag(&plan, &executor, DagOptions::default()).await.unwrap();
        assert_eq!(result.total_cost, 3.5);
    }

    #[derive(Default)]
    struct RoundRecorder {
        rounds: Mutex<Vec<Vec<(String, bool)>>>,
    }

    #[async_trait]
    impl StepExecutor for RoundRecorder {
        async fn execute(&self, step: &PlanStep, _context: &StepContext) -> Result<PlanResult> {
            if step.id == "slow" {
                tokio::time::sleep(Duration::from_millis(10_000)).await;
            }
            Ok(PlanResult::succeeded(step, json!({}), "ok"))
        }

        async fn round_finished(&self, completed: &[(&PlanStep, &PlanResult)]) {
            let round = completed
                .iter()
                .map(|(step, result)| (step.id.clone(), result.success))
                .collect();
            self.rounds.lock().await.push(round);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_finished_sees_each_round() {
        let plan = DagPlan::new(vec![
            step("a", &[]),
            step("slow", &[]),
            step("b", &["a"]),
            step("c", &["slow"]),
        ]);
        let executor = RoundRecorder::default();

        execute_dag(&plan, &executor, DagOptions { timeout_ms: 100 })
            .await
            .unwrap();

        // Timed-out steps are reported; their skipped dependents are not.
        let rounds = executor.rounds.lock().await;
        assert_eq!(
            *rounds,
            vec![
                vec![("a".to_string(), true), ("slow".to_string(), false)],
                vec![("b".to_string(), true)],
            ]
        );
    }

    struct SoftFailure;

    #[async_trait]
    impl StepExecutor for SoftFailure {
        async fn execute(&self, step: &PlanStep, _context: &StepContext) -> Result<PlanResult> {
            Ok(PlanResult::failed(step, "agent declined"))
        }
    }

    #[tokio::test]
    async fn test_unsuccessful_result_counts_as_failure() {
        let plan = DagPlan::new(vec![step("a", &[]), step("b", &["a"])]);
        let result = execute_dag(&plan, &SoftFailure, DagOptions::default()).await.unwrap();

        assert_eq!(result.result_for("a").unwrap().summary, "agent declined");
        assert!(result.result_for("b").unwrap().skipped);
    }
}
