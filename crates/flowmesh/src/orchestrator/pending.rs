//! Pending-step evaluation: `checkAndTriggerPendingSteps` (spec.md §4.2.6).
//!
//! A private submodule of `orchestrator` so it can reach the Orchestrator's
//! Store/Queue handles directly — this is the same code a single large
//! `impl Orchestrator` block would contain, split out for readability.

use std::sync::Arc;

use serde_json::Value;

use crate::adapters::{IndexStore, JobOptions, Queue, StreamStore};
use crate::model::{AnalyzedFlow, AwaitPosition, AwaitStatus, Event, EventType, FlowRun, StepDefinition};
use crate::subjects::{flow_run_index_key, flow_run_subject};

use super::context::RunContext;
use super::Orchestrator;

/// Enqueue the entry step directly off `flow.start` (spec.md §4.2.1: "the
/// entry step is assumed to be enqueued by the caller" — this crate treats
/// the orchestrator as that caller, since nothing else owns `flow.start`).
pub async fn enqueue_entry_step(orchestrator: &Arc<Orchestrator>, analyzed: &AnalyzedFlow, run_id: &str, input: Value) -> anyhow::Result<()> {
    let Some(entry) = analyzed.definition.entry_step.as_deref() else {
        return Ok(());
    };
    let Some(step) = analyzed.step(entry) else {
        return Ok(());
    };
    let job_id = format!("{run_id}__{entry}");
    enqueue_step(orchestrator, step, input, &job_id).await
}

/// Re-enqueue a step whose `awaitBefore` just resolved, with the
/// `__resumed` jobId suffix so the worker bypasses registering it again
/// (spec.md §4.2.5 "resolved, position = before").
pub async fn enqueue_resumed_step(
    orchestrator: &Arc<Orchestrator>,
    analyzed: &AnalyzedFlow,
    run_id: &str,
    step_name: &str,
    await_data: Value,
) -> anyhow::Result<()> {
    let Some(step) = analyzed.step(step_name) else {
        return Ok(());
    };
    let job_id = format!("{run_id}__{step_name}__resumed");
    let payload = serde_json::json!({
        "awaitResolved": true,
        "awaitData": await_data,
        "awaitPosition": "before",
    });
    enqueue_step(orchestrator, step, payload, &job_id).await
}

/// Walk every non-terminal step of the flow and enqueue the ones whose
/// dependencies are now satisfied (spec.md §4.2.6, steps 1-5).
pub async fn check_and_trigger_pending_steps(orchestrator: &Arc<Orchestrator>, analyzed: &AnalyzedFlow, run_id: &str) -> anyhow::Result<()> {
    let index_key = flow_run_index_key(&analyzed.definition.name);
    let Some(entry) = orchestrator.index.get(&index_key, run_id).await? else {
        return Ok(());
    };
    let run: FlowRun = serde_json::from_value(entry.metadata.clone())?;
    if run.status.is_terminal() {
        return Ok(());
    }

    let subject = flow_run_subject(run_id);
    let ctx = RunContext::load(orchestrator.stream.as_ref(), &subject).await?;

    for (step_name, step) in &analyzed.definition.steps {
        if analyzed.definition.entry_step.as_deref() == Some(step_name.as_str()) {
            continue;
        }
        if ctx.completed_steps.contains(step_name) || ctx.failed_steps.contains(step_name) {
            continue;
        }

        // Step 1: awaitBefore gate.
        let before_key = AwaitPosition::Before.key(step_name);
        if step.await_before.is_some() {
            let status = run.awaiting_steps.get(&before_key).map(|s| s.status);
            if matches!(status, Some(AwaitStatus::Awaiting) | Some(AwaitStatus::Timeout)) {
                continue;
            }
        }

        // Steps 2-3: subscription satisfaction, with the awaitAfter hold.
        if !subscriptions_satisfied(analyzed, &run, &ctx, step) {
            continue;
        }

        // Step 4: register awaitBefore instead of running the step body.
        if let Some(cfg) = &step.await_before {
            if !run.awaiting_steps.contains_key(&before_key) {
                publish_await_registered(orchestrator, run_id, &analyzed.definition.name, step_name, AwaitPosition::Before, cfg).await;
            }
            // Whether freshly registered or already resolved, this step's
            // body is enqueued by the registration/resolution path
            // (publish_await_registered here, `enqueue_resumed_step` on
            // resolve) — not from this loop.
            continue;
        }

        // Step 5: collect payload and enqueue.
        let input = build_input(&ctx, step);
        let job_id = format!("{run_id}__{step_name}");
        enqueue_step(orchestrator, step, input, &job_id).await?;
    }

    Ok(())
}

/// Steps 2-3 of §4.2.6: every `subscribes` token must resolve to a
/// completed step or a recorded emit, and an emit token is held back while
/// its emitting step's `awaitAfter` is still open.
fn subscriptions_satisfied(analyzed: &AnalyzedFlow, run: &FlowRun, ctx: &RunContext, step: &StepDefinition) -> bool {
    step.subscribes.iter().all(|token| {
        if let Some(dep_step) = token.strip_prefix("step:") {
            return ctx.completed_steps.contains(dep_step);
        }
        if crate::value::get_path(&run.emitted_events, token).is_none() {
            return false;
        }
        let Some(emitter) = find_emitter(analyzed, token) else {
            return true;
        };
        !await_after_is_open(analyzed, run, ctx, emitter)
    })
}

/// True while `emitter`'s `awaitAfter` has not yet resolved. Prefers the
/// run-index snapshot; falls back to a stream scan for the case where the
/// emitter's `step.completed` is already persisted but the index hasn't
/// caught up with the matching `await.resolved`/`await.timeout` yet
/// (spec.md §4.2.6 step 3, "fallback for pre-persistence race").
fn await_after_is_open(analyzed: &AnalyzedFlow, run: &FlowRun, ctx: &RunContext, emitter: &str) -> bool {
    let Some(step) = analyzed.step(emitter) else { return false };
    if step.await_after.is_none() {
        return false;
    }
    let after_key = AwaitPosition::After.key(emitter);
    if matches!(run.awaiting_steps.get(&after_key).map(|s| s.status), Some(AwaitStatus::Awaiting)) {
        return true;
    }
    ctx.completed_steps.contains(emitter) && !ctx.settled_awaits.contains(&after_key)
}

fn find_emitter<'a>(analyzed: &'a AnalyzedFlow, token: &str) -> Option<&'a str> {
    analyzed
        .definition
        .steps
        .iter()
        .find(|(_, step)| step.emits.iter().any(|e| e == token))
        .map(|(name, _)| name.as_str())
}

/// Step 5's payload: a map from each subscription token to the payload
/// recorded for that emit in the run stream (`step:` tokens carry no
/// payload of their own).
fn build_input(ctx: &RunContext, step: &StepDefinition) -> Value {
    let mut map = serde_json::Map::new();
    for token in &step.subscribes {
        if token.starts_with("step:") {
            continue;
        }
        if let Some(payload) = ctx.emit_payloads.get(token) {
            map.insert(token.clone(), payload.clone());
        }
    }
    Value::Object(map)
}

async fn enqueue_step(orchestrator: &Arc<Orchestrator>, step: &StepDefinition, data: Value, job_id: &str) -> anyhow::Result<()> {
    let opts = JobOptions {
        job_id: Some(job_id.to_string()),
        timeout: Some(step.step_timeout),
        ..Default::default()
    };
    orchestrator.queue.enqueue(&step.queue, &step.worker_id, data, opts).await?;
    Ok(())
}

async fn publish_await_registered(
    orchestrator: &Arc<Orchestrator>,
    run_id: &str,
    flow_name: &str,
    step_name: &str,
    position: AwaitPosition,
    config: &crate::await_subsystem::AwaitConfig,
) {
    let event = Event::ingress(
        EventType::AwaitRegistered,
        run_id.to_string(),
        flow_name.to_string(),
        serde_json::json!({"position": position.as_str(), "config": config}),
    )
    .with_step(step_name.to_string());
    orchestrator.bus.publish(event).await;
}
