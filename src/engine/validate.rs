use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::PlanError;
use crate::types::{DagPlan, StepId};

/// Kahn's algorithm over the plan's dependency edges.
///
/// Returns step ids in an order where every step follows all of its
/// dependencies. Ties keep the plan's declaration order so the result is
/// stable. Rejects duplicate ids, dangling dependencies and cycles, naming the
/// offending steps.
pub fn topological_order(plan: &DagPlan) -> Result<Vec<StepId>, PlanError> {
    let mut position: HashMap<&str, usize> = HashMap::with_capacity(plan.steps.len());
    for (i, step) in plan.steps.iter().enumerate() {
        if position.insert(step.id.as_str(), i).is_some() {
            return Err(PlanError::DuplicateStep(step.id.clone()));
        }
    }

    let mut in_degree = vec![0usize; plan.steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); plan.steps.len()];
    for (i, step) in plan.steps.iter().enumerate() {
        // A repeated dependency is one edge.
        let unique: HashSet<&str> = step.dependencies.iter().map(|d| d.as_str()).collect();
        for dep in unique {
            let Some(&j) = position.get(dep) else {
                return Err(PlanError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.to_string(),
                });
            };
            in_degree[i] += 1;
            dependents[j].push(i);
        }
    }

    let mut queue: VecDeque<usize> = (0..plan.steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(plan.steps.len());

    while let Some(i) = queue.pop_front() {
        order.push(plan.steps[i].id.clone());
        let mut released: Vec<usize> = Vec::new();
        for &k in &dependents[i] {
            in_degree[k] -= 1;
            if in_degree[k] == 0 {
                released.push(k);
            }
        }
        released.sort_unstable();
        queue.extend(released);
    }

    if order.len() < plan.steps.len() {
        let steps = plan
            .steps
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, s)| s.id.clone())
            .collect();
        return Err(PlanError::Cycle { steps });
    }

    Ok(order)
}

/// Structural check run before any step executes. An empty plan is valid.
pub fn validate_plan(plan: &DagPlan) -> Result<(), PlanError> {
    topological_order(plan).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PlanStep;

    fn step(id: &str, deps: &[&str]) -> PlanStep {
        PlanStep::new(id, "agent", "prompt").depends_on(deps)
    }

    #[test]
    fn test_linear_order() {
        let plan = DagPlan::new(vec![step("c", &["b"]), step("b", &["a"]), step("a", &[])]);
        assert_eq!(topological_order(&plan).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_diamond_keeps_declaration_order() {
        let plan = DagPlan::new(vec![
            step("root", &[]),
            step("left", &["root"]),
            step("right", &["root"]),
            step("join", &["left", "right"]),
        ]);
        assert_eq!(
            topological_order(&plan).unwrap(),
            vec!["root", "left", "right", "join"]
        );
    }

    #[test]
    fn test_two_cycle_names_both_steps() {
        let plan = DagPlan::new(vec![step("a", &["b"]), step("b", &["a"])]);
        let err = topological_order(&plan).unwrap_err();
        assert_eq!(
            err,
            PlanError::Cycle {
                steps: vec!["a".to_string(), "b".to_string()]
            }
        );
        assert!(err.to_string().contains("Cycle detected"));
    }

    #[test]
    fn test_cycle_downstream_step_is_reported() {
        let plan = DagPlan::new(vec![
            step("ok", &[]),
            step("x", &["y"]),
            step("y", &["x"]),
            step("after", &["x"]),
        ]);
        match validate_plan(&plan) {
            Err(PlanError::Cycle { steps }) => assert_eq!(steps, vec!["x", "y", "after"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let plan = DagPlan::new(vec![step("a", &["ghost"])]);
        assert_eq!(
            validate_plan(&plan),
            Err(PlanError::UnknownDependency {
                step: "a".to_string(),
                dependency: "ghost".to_string()
            })
        );
    }

    #[test]
    fn test_duplicate_step() {
        let plan = DagPlan::new(vec![step("a", &[]), step("a", &[])]);
        assert_eq!(validate_plan(&plan), Err(PlanError::DuplicateStep("a".to_string())));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let plan = DagPlan::new(vec![step("a", &["a"])]);
        assert!(matches!(validate_plan(&plan), Err(PlanError::Cycle { .. })));
    }

    #[test]
    fn test_empty_plan_is_valid() {
        assert!(validate_plan(&DagPlan::new(vec![])).is_ok());
    }
}
