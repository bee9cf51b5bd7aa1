use std::collections::{HashMap, HashSet};

use bizflow_core::{Error, Result, Step, Workflow};

use crate::schedule::Schedule;

/// Group steps into waves with Kahn's algorithm: every step of a wave only
/// depends on steps of earlier waves. On failure returns the ids that can
/// never become ready (cycle members, unknown dependencies and anything
/// downstream of them), sorted.
pub fn execution_waves(steps: &[Step]) -> std::result::Result<Vec<Vec<String>>, Vec<String>> {
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        indegree.insert(step.id.as_str(), step.dependencies.len());
        for dep in &step.dependencies {
            dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
        }
    }

    let mut waves = Vec::new();
    let mut current: Vec<&str> = steps
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| indegree.get(id) == Some(&0))
        .collect();
    let mut placed = 0;

    while !current.is_empty() {
        current.sort_unstable();
        let mut next = Vec::new();
        for id in &current {
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(n) = indegree.get_mut(dependent) {
                    *n -= 1;
                    if *n == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }
        placed += current.len();
        waves.push(current.iter().map(|s| s.to_string()).collect());
        current = next;
    }

    if placed == steps.len() {
        Ok(waves)
    } else {
        let mut stuck: Vec<String> = indegree
            .into_iter()
            .filter(|(_, n)| *n > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        stuck.sort();
        Err(stuck)
    }
}

/// Structural checks run before a workflow is accepted.
pub fn validate(workflow: &Workflow) -> Result<()> {
    let invalid = |reason: String| Error::InvalidWorkflow(format!("{}: {}", workflow.id, reason));

    let mut ids = HashSet::new();
    for step in &workflow.steps {
        if step.id.trim().is_empty() {
            return Err(invalid("step with empty id".to_string()));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(invalid(format!("duplicate step id '{}'", step.id)));
        }
    }

    for step in &workflow.steps {
        for dep in &step.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(invalid(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
        }
    }

    if let Err(stuck) = execution_waves(&workflow.steps) {
        return Err(invalid(format!("dependency cycle among {}", stuck.join(", "))));
    }

    for expression in workflow.schedule_expressions() {
        Schedule::parse(expression).map_err(|e| invalid(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bizflow_core::{StepAction, Trigger, WorkflowType};
    use serde_json::Value;

    fn step(id: &str, deps: &[&str]) -> Step {
        let mut s = Step::new(
            id,
            StepAction::Function {
                name: "noop".into(),
                args: Value::Null,
            },
        );
        for d in deps {
            s = s.depends_on(d);
        }
        s
    }

    #[test]
    fn test_waves_follow_dependencies() {
        let steps = vec![
            step("notify", &["fetch", "total"]),
            step("total", &["fetch"]),
            step("fetch", &[]),
            step("audit", &[]),
        ];
        let waves = execution_waves(&steps).unwrap();
        assert_eq!(
            waves,
            vec![
                vec!["audit".to_string(), "fetch".to_string()],
                vec!["total".to_string()],
                vec!["notify".to_string()],
            ]
        );
    }

    #[test]
    fn test_cycle_reports_stuck_steps() {
        let steps = vec![step("a", &["b"]), step("b", &["a"]), step("c", &["b"]), step("d", &[])];
        assert_eq!(
            execution_waves(&steps).unwrap_err(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );

        let wf = Workflow::new("loop", "Loop", WorkflowType::Manual)
            .with_step(step("a", &["b"]))
            .with_step(step("b", &["a"]));
        let err = validate(&wf).unwrap_err();
        assert!(err.to_string().contains("dependency cycle among a, b"));
    }

    #[test]
    fn test_validate_rejects_malformed_graphs() {
        let unknown = Workflow::new("wf", "Unknown dep", WorkflowType::Manual)
            .with_step(step("send", &["draft"]));
        assert!(validate(&unknown)
            .unwrap_err()
            .to_string()
            .contains("unknown step 'draft'"));

        let dup = Workflow::new("wf", "Dup", WorkflowType::Manual)
            .with_step(step("x", &[]))
            .with_step(step("x", &[]));
        assert!(validate(&dup).unwrap_err().to_string().contains("duplicate step id"));

        let bad_schedule = Workflow::new("wf", "Bad schedule", WorkflowType::Scheduled)
            .with_step(step("x", &[]))
            .with_trigger(Trigger::Schedule {
                expression: "sometimes".into(),
            });
        assert!(matches!(validate(&bad_schedule), Err(Error::InvalidWorkflow(_))));
    }

    #[test]
    fn test_validate_accepts_empty_and_valid() {
        assert!(validate(&Workflow::new("empty", "Empty", WorkflowType::Manual)).is_ok());
        let wf = Workflow::new("daily", "Daily report", WorkflowType::Scheduled)
            .with_step(step("fetch", &[]))
            .with_step(step("send", &["fetch"]))
            .with_trigger(Trigger::Schedule {
                expression: "0 9 * * 1-5".into(),
            });
        assert!(validate(&wf).is_ok());
    }
}
