//! Terminal status computation (spec.md §4.2.7).
//!
//! Pure function over a run snapshot; no I/O, so it's trivial to exercise
//! every branch without spinning up adapters.

use crate::model::{AnalyzedFlow, AwaitStatus, FlowRun};

use super::context::RunContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Running,
    Awaiting,
    Completed,
    Failed(String),
    Canceled,
}

/// Decide the run's terminal-or-not status from its current step/await
/// state (spec.md §4.2.7).
///
/// A failed step is "blocking" if it has at least one dependent step that
/// never completed. A "critical layer" failure is a topological layer
/// (§3.1 GLOSSARY "Layer") where every member step ultimately failed and at
/// least one member is a leaf (nothing downstream could route around it).
/// Either condition fails the whole run even if other branches are still
/// progressing.
pub fn analyze(analyzed: &AnalyzedFlow, run: &FlowRun, ctx: &RunContext) -> Outcome {
    if ctx.canceled {
        return Outcome::Canceled;
    }

    let all_steps: Vec<&str> = analyzed.step_names().collect();

    let blocking_failure = all_steps.iter().any(|step| {
        ctx.failed_steps.contains(*step)
            && analyzed
                .dependents
                .get(*step)
                .is_some_and(|deps| deps.iter().any(|d| !ctx.completed_steps.contains(d)))
    });

    let mut visited_layers: std::collections::HashSet<&str> = std::collections::HashSet::new();
    let critical_layer_failure = all_steps.iter().any(|step| {
        if !visited_layers.insert(*step) {
            return false;
        }
        let layer = analyzed.layer_of(*step);
        for s in &layer {
            visited_layers.insert(*s);
        }
        !layer.is_empty() && layer.iter().all(|s| ctx.failed_steps.contains(*s)) && layer.iter().any(|s| analyzed.is_leaf(s))
    });

    if blocking_failure || critical_layer_failure {
        let failed: Vec<&str> = all_steps.iter().copied().filter(|s| ctx.failed_steps.contains(*s)).collect();
        return Outcome::Failed(format!("step(s) failed: {}", failed.join(", ")));
    }

    // An outstanding await overrides "all steps terminal": a step.completed
    // for a step with an open awaitAfter doesn't make the step done from the
    // flow's perspective until the await itself resolves (spec.md §4.2.7
    // "overridden if any await in the run is in state awaiting or timeout").
    if run.awaiting_steps.values().any(|a| a.status == AwaitStatus::Timeout) {
        return Outcome::Failed("await timed out".to_string());
    }
    if run.awaiting_steps.values().any(|a| a.status == AwaitStatus::Awaiting) {
        return Outcome::Awaiting;
    }

    let all_terminal = all_steps
        .iter()
        .all(|s| ctx.completed_steps.contains(*s) || ctx.failed_steps.contains(*s));
    if all_terminal {
        return Outcome::Completed;
    }
    Outcome::Running
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FlowDefinition, StepDefinition};

    fn ctx_with(completed: &[&str], failed: &[&str]) -> RunContext {
        RunContext {
            completed_steps: completed.iter().map(|s| s.to_string()).collect(),
            failed_steps: failed.iter().map(|s| s.to_string()).collect(),
            emit_payloads: Default::default(),
            entry_input: serde_json::Value::Null,
            canceled: false,
            settled_awaits: Default::default(),
        }
    }

    fn diamond_flow() -> AnalyzedFlow {
        FlowDefinition::new("f")
            .with_entry_step("E")
            .with_step("E", StepDefinition::new("q", "w").with_emits(["a".to_string()]))
            .with_step("S1", StepDefinition::new("q", "w").with_subscribes(["a".to_string()]))
            .with_step("S2", StepDefinition::new("q", "w").with_subscribes(["step:S1".to_string()]))
            .analyze()
    }

    #[test]
    fn all_steps_completed_is_completed() {
        let analyzed = diamond_flow();
        let run = FlowRun::new("r1", "f", 0);
        let ctx = ctx_with(&["E", "S1", "S2"], &[]);
        assert_eq!(analyze(&analyzed, &run, &ctx), Outcome::Completed);
    }

    #[test]
    fn leaf_failure_is_blocking() {
        let analyzed = diamond_flow();
        let run = FlowRun::new("r1", "f", 0);
        let ctx = ctx_with(&["E", "S1"], &["S2"]);
        assert!(matches!(analyze(&analyzed, &run, &ctx), Outcome::Failed(_)));
    }

    #[test]
    fn non_blocking_failure_with_remaining_work_stays_running() {
        // S2 depends on S1 via step:S1; if S1 fails and nothing downstream
        // of S1 ever completes, S1's failure is blocking. To get a
        // non-blocking failure we need a failed step with no dependents.
        let analyzed = FlowDefinition::new("f")
            .with_entry_step("E")
            .with_step("E", StepDefinition::new("q", "w").with_emits(["a".to_string(), "b".to_string()]))
            .with_step("Optional", StepDefinition::new("q", "w").with_subscribes(["a".to_string()]))
            .with_step("Main", StepDefinition::new("q", "w").with_subscribes(["b".to_string()]))
            .analyze();
        let run = FlowRun::new("r1", "f", 0);
        let ctx = ctx_with(&["E"], &["Optional"]);
        assert_eq!(analyze(&analyzed, &run, &ctx), Outcome::Running);
    }

    #[test]
    fn cancel_takes_priority() {
        let analyzed = diamond_flow();
        let run = FlowRun::new("r1", "f", 0);
        let mut ctx = ctx_with(&[], &["E"]);
        ctx.canceled = true;
        assert_eq!(analyze(&analyzed, &run, &ctx), Outcome::Canceled);
    }

    #[test]
    fn open_await_after_blocks_completion_even_with_every_step_terminal() {
        let analyzed = FlowDefinition::new("f")
            .with_entry_step("S")
            .with_step("S", StepDefinition::new("q", "w"))
            .analyze();
        let mut run = FlowRun::new("r1", "f", 0);
        run.awaiting_steps.insert(
            "S:after".to_string(),
            crate::model::AwaitState {
                status: AwaitStatus::Awaiting,
                await_type: crate::await_subsystem::AwaitKind::Webhook,
                registered_at: 0,
                timeout_at: Some(1_000),
                position: crate::model::AwaitPosition::After,
                trigger_data: None,
                config: serde_json::Value::Null,
            },
        );
        let ctx = ctx_with(&["S"], &[]);
        assert_eq!(analyze(&analyzed, &run, &ctx), Outcome::Awaiting);
    }
}
