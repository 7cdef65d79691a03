//! End-to-end behavior of a wired [`Runtime`] over the in-memory adapters:
//! one test per archetypal run shape (linear success, parallel branch,
//! blocking chain, both await positions, cancellation, crash recovery),
//! plus a handful of targeted tests for the cross-cutting guarantees the
//! orchestrator is supposed to uphold regardless of flow shape.
//!
//! A worker is never actually spawned here — these tests play the worker's
//! part themselves, publishing the `emit`/`step.completed`/`step.failed`/
//! `await.registered` events a real worker would report after running a
//! step body. Because `Orchestrator::orchestration_entry` routes a run's
//! events through a per-run lane and only returns once that lane's handler
//! chain has fully drained, each `bus.publish(...).await` below already
//! reflects every downstream reaction (persistence, pending-step
//! evaluation, finalization) by the time it resolves — no `sleep` or
//! `yield_now` needed except around the handful of assertions that wait on
//! a genuine scheduler timer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use flowmesh::adapters::memory::{InMemoryQueue, InMemoryStore};
use flowmesh::adapters::{IndexStore, Queue, StreamFilter, StreamStore};
use flowmesh::await_subsystem::{AwaitConfig, AwaitKind, TimeoutAction};
use flowmesh::bus::EventBus;
use flowmesh::model::{
    now_ms, AwaitPosition, AwaitResolveType, AwaitState, AwaitStatus, Event, EventType, FlowDefinition, FlowRun,
    JobKind, RunStatus, ScheduledJob, StepDefinition,
};
use flowmesh::runtime::{Runtime, RuntimeConfig};
use flowmesh::scheduler::{Scheduler, SchedulerConfig};
use flowmesh::subjects::{flow_index_key, flow_run_index_key, flow_run_subject};

async fn test_runtime() -> (Arc<Runtime>, Arc<InMemoryStore>, Arc<InMemoryQueue>) {
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(InMemoryQueue::new());
    let runtime = Runtime::new(store.clone(), store.clone(), store.clone(), queue.clone(), RuntimeConfig::default());
    runtime.start().await.unwrap();
    (runtime, store, queue)
}

async fn run_status(store: &InMemoryStore, flow_name: &str, run_id: &str) -> RunStatus {
    load_run(store, flow_name, run_id).await.status
}

async fn load_run(store: &InMemoryStore, flow_name: &str, run_id: &str) -> FlowRun {
    let entry = IndexStore::get(store, &flow_run_index_key(flow_name), run_id).await.unwrap().unwrap();
    serde_json::from_value(entry.metadata).unwrap()
}

async fn stream_event_count(store: &InMemoryStore, run_id: &str, event_type: &str) -> usize {
    let filter = StreamFilter {
        types: Some(vec![event_type.to_string()]),
        ..Default::default()
    };
    store.read(&flow_run_subject(run_id), filter).await.unwrap().len()
}

async fn emit(runtime: &Runtime, run_id: &str, flow_name: &str, step: &str, name: &str, payload: serde_json::Value) {
    let event = Event::ingress(EventType::Emit, run_id.to_string(), flow_name.to_string(), json!({"name": name, "payload": payload})).with_step(step);
    runtime.bus.publish(event).await;
}

async fn complete_step(runtime: &Runtime, run_id: &str, flow_name: &str, step: &str) {
    let event = Event::ingress(EventType::StepCompleted, run_id.to_string(), flow_name.to_string(), json!({})).with_step(step);
    runtime.bus.publish(event).await;
}

async fn fail_step(runtime: &Runtime, run_id: &str, flow_name: &str, step: &str, reason: &str) {
    let event = Event::ingress(EventType::StepFailed, run_id.to_string(), flow_name.to_string(), json!({"reason": reason})).with_step(step);
    runtime.bus.publish(event).await;
}

async fn register_await(runtime: &Runtime, run_id: &str, flow_name: &str, step: &str, position: AwaitPosition, config: &AwaitConfig) {
    let event = Event::ingress(
        EventType::AwaitRegistered,
        run_id.to_string(),
        flow_name.to_string(),
        json!({"position": position.as_str(), "config": config}),
    )
    .with_step(step);
    runtime.bus.publish(event).await;
}

fn webhook_config(timeout: Duration) -> AwaitConfig {
    AwaitConfig {
        kind: AwaitKind::Webhook,
        delay: None,
        timeout: Some(timeout),
        timeout_action: TimeoutAction::Fail,
        cron: None,
        timezone: None,
        event_pattern: None,
    }
}

#[tokio::test]
async fn linear_flow_all_steps_succeed_completes_once() {
    let (runtime, store, _queue) = test_runtime().await;
    runtime.register_flow(
        FlowDefinition::new("f1")
            .with_entry_step("E")
            .with_step("E", StepDefinition::new("q", "w").with_emits(["a".to_string()]))
            .with_step(
                "S1",
                StepDefinition::new("q", "w").with_subscribes(["a".to_string()]).with_emits(["b".to_string()]),
            )
            .with_step("S2", StepDefinition::new("q", "w").with_subscribes(["b".to_string()])),
    );

    let run_id = runtime.start_flow("f1", json!({})).await.unwrap();

    emit(&runtime, &run_id, "f1", "E", "a", json!({"x": 1})).await;
    complete_step(&runtime, &run_id, "f1", "E").await;

    emit(&runtime, &run_id, "f1", "S1", "b", json!({"y": 2})).await;
    complete_step(&runtime, &run_id, "f1", "S1").await;

    complete_step(&runtime, &run_id, "f1", "S2").await;

    assert_eq!(run_status(&store, "f1", &run_id).await, RunStatus::Completed);
    assert_eq!(stream_event_count(&store, &run_id, "flow.completed").await, 1);

    let stats = IndexStore::get(store.as_ref(), flow_index_key(), "f1").await.unwrap().unwrap();
    assert_eq!(stats.metadata["totalRuns"], json!(1));
    assert_eq!(stats.metadata["runningCount"], json!(0));
    assert_eq!(stats.metadata["completedCount"], json!(1));
}

#[tokio::test]
async fn parallel_siblings_one_permanent_failure_still_completes() {
    let (runtime, store, _queue) = test_runtime().await;
    runtime.register_flow(
        FlowDefinition::new("f2")
            .with_entry_step("E")
            .with_step("E", StepDefinition::new("q", "w").with_emits(["x".to_string()]))
            .with_step("A", StepDefinition::new("q", "w").with_subscribes(["x".to_string()]))
            .with_step("B", StepDefinition::new("q", "w").with_subscribes(["x".to_string()])),
    );

    let run_id = runtime.start_flow("f2", json!({})).await.unwrap();
    emit(&runtime, &run_id, "f2", "E", "x", json!({})).await;
    complete_step(&runtime, &run_id, "f2", "E").await;

    complete_step(&runtime, &run_id, "f2", "A").await;
    fail_step(&runtime, &run_id, "f2", "B", "permanent failure").await;

    let run = load_run(&store, "f2", &run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_steps, 2);
    assert_eq!(stream_event_count(&store, &run_id, "step.failed").await, 1);
}

#[tokio::test]
async fn blocking_chain_failure_fails_flow_and_skips_downstream() {
    let (runtime, store, queue) = test_runtime().await;
    runtime.register_flow(
        FlowDefinition::new("f3")
            .with_entry_step("E")
            .with_step("E", StepDefinition::new("q", "w"))
            .with_step("A", StepDefinition::new("q", "w").with_subscribes(["step:E".to_string()]))
            .with_step("B", StepDefinition::new("q", "w").with_subscribes(["step:A".to_string()])),
    );

    let run_id = runtime.start_flow("f3", json!({})).await.unwrap();
    complete_step(&runtime, &run_id, "f3", "E").await;
    assert!(Queue::get_job(queue.as_ref(), "q", &format!("{run_id}__A")).await.unwrap().is_some());

    fail_step(&runtime, &run_id, "f3", "A", "permanent").await;

    assert!(Queue::get_job(queue.as_ref(), "q", &format!("{run_id}__B")).await.unwrap().is_none());
    assert_eq!(run_status(&store, "f3", &run_id).await, RunStatus::Failed);
    assert_eq!(stream_event_count(&store, &run_id, "flow.failed").await, 1);
}

#[tokio::test]
async fn await_before_time_resumes_gated_step_exactly_once() {
    let (runtime, store, queue) = test_runtime().await;
    runtime.register_flow(
        FlowDefinition::new("f4")
            .with_entry_step("E")
            .with_step("E", StepDefinition::new("q", "w").with_emits(["y".to_string()]))
            .with_step(
                "S",
                StepDefinition::new("q", "w").with_subscribes(["y".to_string()]).with_await_before(AwaitConfig {
                    kind: AwaitKind::Time,
                    delay: Some(Duration::from_millis(30)),
                    timeout: None,
                    timeout_action: TimeoutAction::Fail,
                    cron: None,
                    timezone: None,
                    event_pattern: None,
                }),
            ),
    );

    let run_id = runtime.start_flow("f4", json!({})).await.unwrap();
    emit(&runtime, &run_id, "f4", "E", "y", json!({})).await;
    complete_step(&runtime, &run_id, "f4", "E").await;

    // Gated behind awaitBefore: not enqueued as a direct job yet.
    assert!(Queue::get_job(queue.as_ref(), "q", &format!("{run_id}__S")).await.unwrap().is_none());
    assert_eq!(run_status(&store, "f4", &run_id).await, RunStatus::Awaiting);

    tokio::time::sleep(Duration::from_millis(200)).await;

    let job = Queue::get_job(queue.as_ref(), "q", &format!("{run_id}__S__resumed")).await.unwrap();
    assert_eq!(
        job.expect("resumed job should be enqueued once the delay elapses").data,
        json!({"awaitResolved": true, "awaitData": {"delayCompleted": true}, "awaitPosition": "before"}),
    );
    assert!(Queue::get_job(queue.as_ref(), "q", &format!("{run_id}__S")).await.unwrap().is_none());

    complete_step(&runtime, &run_id, "f4", "S").await;
    assert_eq!(run_status(&store, "f4", &run_id).await, RunStatus::Completed);
}

#[tokio::test]
async fn await_after_webhook_timeout_fails_step_and_flow() {
    let (runtime, store, _queue) = test_runtime().await;
    runtime.register_flow(
        FlowDefinition::new("f5")
            .with_entry_step("S")
            .with_step("S", StepDefinition::new("q", "w").with_await_after(webhook_config(Duration::from_millis(30)))),
    );

    let run_id = runtime.start_flow("f5", json!({})).await.unwrap();
    complete_step(&runtime, &run_id, "f5", "S").await;

    // Registering awaitAfter is the completing worker's own responsibility
    // (flowmesh::await_subsystem), not something the orchestrator does for
    // it — so the run stays `running` until the worker reports it.
    register_await(&runtime, &run_id, "f5", "S", AwaitPosition::After, &webhook_config(Duration::from_millis(30))).await;
    assert_eq!(run_status(&store, "f5", &run_id).await, RunStatus::Awaiting);

    tokio::time::sleep(Duration::from_millis(200)).await;

    let run = load_run(&store, "f5", &run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.last_error.as_deref(), Some("Await timeout: S"));
    assert_eq!(stream_event_count(&store, &run_id, "step.failed").await, 1);
    assert_eq!(stream_event_count(&store, &run_id, "await.timeout").await, 1);
    assert_eq!(stream_event_count(&store, &run_id, "await.resolved").await, 0);
}

#[tokio::test]
async fn cancel_mid_execution_ignores_later_completion() {
    let (runtime, store, queue) = test_runtime().await;
    runtime.register_flow(FlowDefinition::new("f6").with_entry_step("A").with_step("A", StepDefinition::new("q", "w")));

    let run_id = runtime.start_flow("f6", json!({})).await.unwrap();
    assert!(Queue::get_job(queue.as_ref(), "q", &format!("{run_id}__A")).await.unwrap().is_some());

    runtime
        .bus
        .publish(Event::ingress(EventType::FlowCancel, run_id.clone(), "f6".to_string(), json!({})))
        .await;
    assert_eq!(run_status(&store, "f6", &run_id).await, RunStatus::Canceled);
    assert!(runtime.scheduler.get_jobs_by_pattern(&run_id).is_empty());

    complete_step(&runtime, &run_id, "f6", "A").await;
    assert_eq!(run_status(&store, "f6", &run_id).await, RunStatus::Canceled);
    assert_eq!(stream_event_count(&store, &run_id, "flow.completed").await, 0);
    assert_eq!(stream_event_count(&store, &run_id, "flow.failed").await, 0);
}

#[tokio::test]
async fn startup_recovery_rewrites_active_await_and_stalls_expired() {
    let (runtime, store, _queue) = test_runtime().await;
    runtime.register_flow(
        FlowDefinition::new("f7")
            .with_entry_step("S")
            .with_step("S", StepDefinition::new("q", "w").with_await_after(webhook_config(Duration::from_secs(60)))),
    );

    let mut active_run = FlowRun::new("f7-1-000001", "f7", now_ms());
    active_run.status = RunStatus::Running;
    active_run.awaiting_steps.insert(
        "S:after".to_string(),
        AwaitState {
            status: AwaitStatus::Awaiting,
            await_type: AwaitKind::Webhook,
            registered_at: now_ms(),
            timeout_at: Some(now_ms() + 60_000),
            position: AwaitPosition::After,
            trigger_data: None,
            config: serde_json::Value::Null,
        },
    );
    IndexStore::add(store.as_ref(), &flow_run_index_key("f7"), &active_run.run_id, 0.0, serde_json::to_value(&active_run).unwrap())
        .await
        .unwrap();

    let mut overdue_run = FlowRun::new("f7-1-000002", "f7", now_ms());
    overdue_run.status = RunStatus::Running;
    overdue_run.awaiting_steps.insert(
        "S:after".to_string(),
        AwaitState {
            status: AwaitStatus::Awaiting,
            await_type: AwaitKind::Webhook,
            registered_at: now_ms(),
            timeout_at: Some(now_ms() - 1_000),
            position: AwaitPosition::After,
            trigger_data: None,
            config: serde_json::Value::Null,
        },
    );
    IndexStore::add(
        store.as_ref(),
        &flow_run_index_key("f7"),
        &overdue_run.run_id,
        0.0,
        serde_json::to_value(&overdue_run).unwrap(),
    )
    .await
    .unwrap();

    runtime.stall.recover().await.unwrap();

    assert_eq!(run_status(&store, "f7", &active_run.run_id).await, RunStatus::Awaiting);
    let stalled = load_run(&store, "f7", &overdue_run.run_id).await;
    assert_eq!(stalled.status, RunStatus::Stalled);
    assert_eq!(stalled.stall_reason.as_deref(), Some("await timeout missed during restart"));
}

#[tokio::test]
async fn concurrent_publishes_for_one_run_are_serialized_through_its_lane() {
    let (runtime, store, _queue) = test_runtime().await;
    runtime.register_flow(
        FlowDefinition::new("fi1")
            .with_entry_step("E")
            .with_step("E", StepDefinition::new("q", "w").with_emits(["a".to_string(), "b".to_string()]))
            .with_step("S", StepDefinition::new("q", "w").with_subscribes(["a".to_string(), "b".to_string()])),
    );
    let run_id = runtime.start_flow("fi1", json!({})).await.unwrap();

    let r1 = runtime.clone();
    let id1 = run_id.clone();
    let h1 = tokio::spawn(async move { emit(&r1, &id1, "fi1", "E", "a", json!({})).await });
    let r2 = runtime.clone();
    let id2 = run_id.clone();
    let h2 = tokio::spawn(async move { emit(&r2, &id2, "fi1", "E", "b", json!({})).await });
    h1.await.unwrap();
    h2.await.unwrap();

    complete_step(&runtime, &run_id, "fi1", "E").await;
    complete_step(&runtime, &run_id, "fi1", "S").await;

    assert_eq!(run_status(&store, "fi1", &run_id).await, RunStatus::Completed);
}

#[tokio::test]
async fn completed_steps_count_matches_distinct_step_completed_events_at_terminal_time() {
    let (runtime, store, _queue) = test_runtime().await;
    runtime.register_flow(
        FlowDefinition::new("fi2")
            .with_entry_step("E")
            .with_step("E", StepDefinition::new("q", "w").with_emits(["a".to_string()]))
            .with_step("S1", StepDefinition::new("q", "w").with_subscribes(["a".to_string()])),
    );
    let run_id = runtime.start_flow("fi2", json!({})).await.unwrap();

    emit(&runtime, &run_id, "fi2", "E", "a", json!({})).await;
    complete_step(&runtime, &run_id, "fi2", "E").await;
    complete_step(&runtime, &run_id, "fi2", "S1").await;

    let run = load_run(&store, "fi2", &run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_steps as usize, stream_event_count(&store, &run_id, "step.completed").await);
}

#[tokio::test]
async fn terminal_status_never_changes_once_reached() {
    let (runtime, store, _queue) = test_runtime().await;
    runtime.register_flow(FlowDefinition::new("fi3").with_entry_step("E").with_step("E", StepDefinition::new("q", "w")));
    let run_id = runtime.start_flow("fi3", json!({})).await.unwrap();

    complete_step(&runtime, &run_id, "fi3", "E").await;
    assert_eq!(run_status(&store, "fi3", &run_id).await, RunStatus::Completed);

    fail_step(&runtime, &run_id, "fi3", "E", "late failure, must not matter").await;

    assert_eq!(run_status(&store, "fi3", &run_id).await, RunStatus::Completed);
    assert_eq!(stream_event_count(&store, &run_id, "flow.completed").await, 1);
    assert_eq!(stream_event_count(&store, &run_id, "flow.failed").await, 0);
}

#[tokio::test]
async fn webhook_resolution_unschedules_the_timeout_guard_so_only_resolved_fires() {
    let (runtime, store, _queue) = test_runtime().await;
    runtime.register_flow(
        FlowDefinition::new("fi4")
            .with_entry_step("S")
            .with_step("S", StepDefinition::new("q", "w").with_await_after(webhook_config(Duration::from_millis(40)))),
    );
    let run_id = runtime.start_flow("fi4", json!({})).await.unwrap();
    complete_step(&runtime, &run_id, "fi4", "S").await;
    register_await(&runtime, &run_id, "fi4", "S", AwaitPosition::After, &webhook_config(Duration::from_millis(40))).await;

    runtime.awaits.resolve_webhook(&run_id, "fi4", "S", AwaitPosition::After, json!({"ok": true})).await;

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(run_status(&store, "fi4", &run_id).await, RunStatus::Completed);
    assert_eq!(stream_event_count(&store, &run_id, "await.resolved").await, 1);
    assert_eq!(stream_event_count(&store, &run_id, "await.timeout").await, 0);
}

#[tokio::test]
async fn index_increment_is_atomic_under_concurrent_callers() {
    let store = Arc::new(InMemoryStore::new());
    IndexStore::add(store.as_ref(), "counters", "c1", 0.0, json!({"n": 0})).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..50 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            IndexStore::increment(store.as_ref(), "counters", "c1", "n", 1).await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let entry = IndexStore::get(store.as_ref(), "counters", "c1").await.unwrap().unwrap();
    assert_eq!(entry.metadata["n"], json!(50));
}

#[tokio::test]
async fn stats_reconciliation_at_startup_matches_run_index_scan() {
    let (runtime, store, _queue) = test_runtime().await;
    runtime.register_flow(FlowDefinition::new("fi6").with_entry_step("E").with_step("E", StepDefinition::new("q", "w")));

    let r1 = FlowRun::new("fi6-1-000001", "fi6", now_ms());
    IndexStore::add(store.as_ref(), &flow_run_index_key("fi6"), &r1.run_id, 0.0, serde_json::to_value(&r1).unwrap())
        .await
        .unwrap();

    let mut r2 = FlowRun::new("fi6-1-000002", "fi6", now_ms());
    r2.status = RunStatus::Awaiting;
    r2.awaiting_steps.insert(
        "E:before".to_string(),
        AwaitState {
            status: AwaitStatus::Awaiting,
            await_type: AwaitKind::Time,
            registered_at: now_ms(),
            timeout_at: Some(now_ms() + 60_000),
            position: AwaitPosition::Before,
            trigger_data: None,
            config: serde_json::Value::Null,
        },
    );
    IndexStore::add(store.as_ref(), &flow_run_index_key("fi6"), &r2.run_id, 0.0, serde_json::to_value(&r2).unwrap())
        .await
        .unwrap();

    // Seed the flow-stats entry with stale counters, as if a prior instance
    // died mid-run without ever publishing the completions that would have
    // brought them down.
    IndexStore::add(
        store.as_ref(),
        flow_index_key(),
        "fi6",
        0.0,
        json!({
            "flowName": "fi6", "totalRuns": 2, "runningCount": 5, "awaitingCount": 5,
            "completedCount": 0, "failedCount": 0, "canceledCount": 0, "stalledCount": 0,
        }),
    )
    .await
    .unwrap();

    runtime.stall.recover().await.unwrap();

    let stats = IndexStore::get(store.as_ref(), flow_index_key(), "fi6").await.unwrap().unwrap();
    assert_eq!(stats.metadata["runningCount"], json!(1));
    assert_eq!(stats.metadata["awaitingCount"], json!(1));
}

#[tokio::test]
async fn scheduler_lock_gives_mutual_exclusion_across_instances_sharing_one_store() {
    let store = Arc::new(InMemoryStore::new());
    let bus = EventBus::new();
    let fire_count = Arc::new(AtomicUsize::new(0));
    let fire_count2 = fire_count.clone();
    bus.on_type(EventType::AwaitResolved.as_str(), move |_| {
        let fire_count2 = fire_count2.clone();
        async move {
            fire_count2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let scheduler_a = Scheduler::new(bus.clone(), store.clone(), store.clone(), SchedulerConfig::default());
    let scheduler_b = Scheduler::new(bus.clone(), store.clone(), store.clone(), SchedulerConfig::default());

    let job = ScheduledJob::one_time(
        "shared-job",
        now_ms(),
        JobKind::AwaitResolve {
            run_id: "r1".into(),
            flow_name: "f1".into(),
            step_name: "S".into(),
            position: AwaitPosition::Before,
            await_type: AwaitResolveType::Time,
        },
    );
    // Two scheduler instances that both learn about the same job id and
    // arm their own local timer for it, as would happen if two runtime
    // processes shared one durable store and both ran recovery.
    scheduler_a.schedule(job.clone()).await.unwrap();
    scheduler_b.schedule(job).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fire_count.load(Ordering::SeqCst), 1);
}
