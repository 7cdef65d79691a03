//! Flow orchestrator: the persistence/orchestration/stats pipeline that
//! drives a run from `flow.start` through to a terminal status
//! (spec.md §4.1, §4.2).
//!
//! Events for the same run must be processed in the order they're
//! published even when several publishers race (a worker reporting
//! `step.completed` while another publishes `emit`). Each run gets its own
//! "lane": a single-consumer channel with one spawned worker task, so two
//! events for run R are never evaluated concurrently. A handler running
//! inside a run's lane sometimes needs to publish another event for the
//! *same* run synchronously (an await-timeout "fail" action publishing
//! `step.failed`) — naively resubmitting that through the lane's own
//! channel would deadlock the worker against itself, so `CURRENT_LANE`
//! marks which run's lane the current task is inside, and a reentrant
//! publish calls straight through instead of going back through the
//! channel.

pub mod completion;
pub mod context;
mod pending;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::adapters::{IndexStore, Queue, QueueError, StoreError, StreamStore};
use crate::await_subsystem::AwaitConfig;
use crate::bus::EventBus;
use crate::model::{
    now_ms, new_run_id, AnalyzedFlow, AwaitPosition, AwaitState, AwaitStatus, Event, EventType, FlowRun, RunStatus,
};
use crate::registry::FlowRegistry;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::subjects::{flow_index_key, flow_run_index_key, flow_run_subject};
use crate::value::nest;

use completion::{analyze, Outcome};
use context::RunContext;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("flow {0:?} is not registered")]
    UnknownFlow(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Max retries for optimistic-concurrency index updates (spec.md §4.2.9).
    pub max_index_retries: u32,
    /// How long an idle per-run lane stays alive before its worker task exits.
    pub lane_idle_eviction: Duration,
    /// How long a finalized run stays in the terminal-publish guard before
    /// the guard entry is released.
    pub terminal_guard_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_index_retries: 5,
            lane_idle_eviction: Duration::from_secs(60),
            terminal_guard_delay: Duration::from_millis(200),
        }
    }
}

tokio::task_local! {
    /// Set for the duration of a lane worker's call into
    /// [`Orchestrator::process_orchestration`]; lets a handler running
    /// inside run R's lane detect that it's already inside R's lane.
    static CURRENT_LANE: String;
}

struct LaneMessage {
    event: Event,
    done: oneshot::Sender<()>,
}

struct LaneHandle {
    tx: mpsc::UnboundedSender<LaneMessage>,
}

/// Drives flow runs from `flow.start` to a terminal status by wiring the
/// persistence/orchestration/stats pipeline onto the bus (spec.md §4.1).
pub struct Orchestrator {
    bus: EventBus,
    stream: Arc<dyn StreamStore>,
    index: Arc<dyn IndexStore>,
    queue: Arc<dyn Queue>,
    scheduler: Arc<Scheduler>,
    registry: Arc<FlowRegistry>,
    lanes: DashMap<String, LaneHandle>,
    terminal_guard: Mutex<HashSet<String>>,
    config: OrchestratorConfig,
}

const PERSIST_AND_ORCHESTRATE: &[EventType] = &[
    EventType::FlowStart,
    EventType::StepStarted,
    EventType::StepCompleted,
    EventType::StepFailed,
    EventType::StepRetry,
    EventType::Emit,
    EventType::AwaitRegistered,
    EventType::AwaitResolved,
    EventType::AwaitTimeout,
    EventType::FlowCancel,
];

const PERSIST_ONLY: &[EventType] = &[
    EventType::FlowCompleted,
    EventType::FlowFailed,
    EventType::FlowStalled,
    EventType::Log,
    EventType::State,
];

const STATS_TYPES: &[EventType] = &[
    EventType::FlowStart,
    EventType::FlowCompleted,
    EventType::FlowFailed,
    EventType::FlowCancel,
    EventType::FlowStalled,
    EventType::AwaitRegistered,
    EventType::AwaitResolved,
    EventType::AwaitTimeout,
];

impl Orchestrator {
    pub fn new(
        bus: EventBus,
        stream: Arc<dyn StreamStore>,
        index: Arc<dyn IndexStore>,
        queue: Arc<dyn Queue>,
        scheduler: Arc<Scheduler>,
        registry: Arc<FlowRegistry>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            stream,
            index,
            queue,
            scheduler,
            registry,
            lanes: DashMap::new(),
            terminal_guard: Mutex::new(HashSet::new()),
            config,
        })
    }

    /// Wire the three-stage pipeline onto the bus. Call once at startup,
    /// before the first flow is started.
    pub fn wire(self: &Arc<Self>) {
        for ty in PERSIST_AND_ORCHESTRATE.iter().chain(PERSIST_ONLY.iter()) {
            self.register_persistence(*ty);
        }
        for ty in PERSIST_AND_ORCHESTRATE {
            self.register_orchestration(*ty);
        }
        for ty in STATS_TYPES {
            self.register_stats(*ty);
        }
    }

    fn register_persistence(self: &Arc<Self>, ty: EventType) {
        let this = self.clone();
        self.bus.on_type(ty.as_str(), move |event| {
            let this = this.clone();
            async move { this.persistence_stage(event).await }
        });
    }

    fn register_orchestration(self: &Arc<Self>, ty: EventType) {
        let this = self.clone();
        self.bus.on_type(ty.as_str(), move |event| {
            let this = this.clone();
            async move { this.orchestration_entry(event).await }
        });
    }

    fn register_stats(self: &Arc<Self>, ty: EventType) {
        let this = self.clone();
        self.bus.on_type(ty.as_str(), move |event| {
            let this = this.clone();
            async move { this.stats_stage(event).await }
        });
    }

    /// Create a run and publish its `flow.start` (spec.md §4.2.1).
    pub async fn start_flow(self: &Arc<Self>, flow_name: &str, input: Value) -> Result<String, OrchestratorError> {
        let analyzed = self
            .registry
            .get(flow_name)
            .ok_or_else(|| OrchestratorError::UnknownFlow(flow_name.to_string()))?;
        let run_id = new_run_id(flow_name);
        let started_at = now_ms();
        let mut run = FlowRun::new(run_id.clone(), flow_name, started_at);
        run.step_count = analyzed.definition.steps.len() as u32;

        let index_key = flow_run_index_key(flow_name);
        self.index.add(&index_key, &run_id, started_at as f64, serde_json::to_value(&run)?).await?;

        let event = Event::ingress(EventType::FlowStart, run_id.clone(), flow_name.to_string(), json!({"input": input}));
        self.bus.publish(event).await;

        Ok(run_id)
    }

    /// Stage 1: append the ingress event to the run's stream, then
    /// republish the persisted copy (spec.md §4.1 "Persistence").
    async fn persistence_stage(self: Arc<Self>, event: Event) -> anyhow::Result<()> {
        if event.is_persisted() {
            return Ok(());
        }
        let subject = flow_run_subject(&event.run_id);
        let payload = serde_json::to_value(&event)?;
        let stream_event = self.stream.append(&subject, event.event_type(), payload).await?;
        let persisted = event.into_persisted(stream_event.id, stream_event.ts);
        self.bus.publish(persisted).await;
        Ok(())
    }

    /// Stage 2 entry point: route a persisted event through the run's
    /// lane, unless we're already inside that lane (see module docs).
    async fn orchestration_entry(self: Arc<Self>, event: Event) -> anyhow::Result<()> {
        if !event.is_persisted() {
            return Ok(());
        }
        let reentrant = CURRENT_LANE.try_with(|r| r == &event.run_id).unwrap_or(false);
        if reentrant {
            return self.process_orchestration(&event).await;
        }

        let tx = self.get_or_create_lane(&event.run_id);
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(LaneMessage { event: event.clone(), done: done_tx }).is_err() {
            tracing::warn!(run_id = %event.run_id, "lane worker unavailable, dropping orchestration event");
            return Ok(());
        }
        let _ = done_rx.await;
        Ok(())
    }

    fn get_or_create_lane(self: &Arc<Self>, run_id: &str) -> mpsc::UnboundedSender<LaneMessage> {
        if let Some(existing) = self.lanes.get(run_id) {
            return existing.tx.clone();
        }
        let this = self.clone();
        let run_id_owned = run_id.to_string();
        let entry = self.lanes.entry(run_id.to_string()).or_insert_with(move || {
            let (tx, rx) = mpsc::unbounded_channel();
            this.spawn_lane_worker(run_id_owned, rx);
            LaneHandle { tx }
        });
        entry.tx.clone()
    }

    fn spawn_lane_worker(self: Arc<Self>, run_id: String, mut rx: mpsc::UnboundedReceiver<LaneMessage>) {
        let idle = self.config.lane_idle_eviction;
        tokio::spawn(async move {
            loop {
                match tokio::time::timeout(idle, rx.recv()).await {
                    Ok(Some(msg)) => {
                        let LaneMessage { event, done } = msg;
                        let this = self.clone();
                        let run_id_for_scope = event.run_id.clone();
                        CURRENT_LANE
                            .scope(run_id_for_scope, async move {
                                if let Err(err) = this.process_orchestration(&event).await {
                                    tracing::error!(error = %err, run_id = %event.run_id, "orchestration stage failed");
                                }
                            })
                            .await;
                        let _ = done.send(());
                    }
                    Ok(None) => break,
                    Err(_elapsed) => break,
                }
            }
            self.lanes.remove(&run_id);
        });
    }

    /// Dispatch a persisted event to its handler (spec.md §4.2.1-§4.2.8).
    async fn process_orchestration(self: &Arc<Self>, event: &Event) -> anyhow::Result<()> {
        match EventType::parse(event.event_type()) {
            Some(EventType::FlowStart) => self.handle_flow_start(event).await,
            Some(EventType::StepCompleted) => self.handle_step_terminal(event, true).await,
            Some(EventType::StepFailed) => self.handle_step_terminal(event, false).await,
            Some(EventType::Emit) => self.handle_emit(event).await,
            Some(EventType::AwaitRegistered) => self.handle_await_registered(event).await,
            Some(EventType::AwaitResolved) => self.handle_await_resolution(event, AwaitStatus::Resolved).await,
            Some(EventType::AwaitTimeout) => self.handle_await_resolution(event, AwaitStatus::Timeout).await,
            Some(EventType::FlowCancel) => self.handle_flow_cancel(event).await,
            // step.retry and step.started carry no orchestration reaction:
            // retry-cleared failure membership is derived at read time by
            // RunContext, and a worker reports step.started purely for
            // observability.
            _ => Ok(()),
        }
    }

    async fn handle_flow_start(self: &Arc<Self>, event: &Event) -> anyhow::Result<()> {
        let Some(analyzed) = self.registry.get(&event.flow_name) else {
            tracing::error!(flow = %event.flow_name, "flow.start for unregistered flow");
            return Ok(());
        };
        let input = event.data.get("input").cloned().unwrap_or(Value::Null);
        pending::enqueue_entry_step(self, &analyzed, &event.run_id, input).await?;
        Ok(())
    }

    async fn handle_step_terminal(self: &Arc<Self>, event: &Event, completed: bool) -> anyhow::Result<()> {
        let Some(analyzed) = self.registry.get(&event.flow_name) else { return Ok(()) };
        if completed {
            let index_key = flow_run_index_key(&event.flow_name);
            let _ = self.index.increment(&index_key, &event.run_id, "completedSteps", 1).await;
        }
        pending::check_and_trigger_pending_steps(self, &analyzed, &event.run_id).await?;
        self.maybe_finalize(&analyzed, &event.run_id).await
    }

    async fn handle_emit(self: &Arc<Self>, event: &Event) -> anyhow::Result<()> {
        let Some(analyzed) = self.registry.get(&event.flow_name) else { return Ok(()) };
        let Some(name) = event.data.get("name").and_then(|v| v.as_str()) else { return Ok(()) };
        let ts = event.persisted.as_ref().map(|p| p.ts).unwrap_or_else(now_ms);
        let patch = nest(&format!("emittedEvents.{name}"), json!(ts))?;
        let index_key = flow_run_index_key(&event.flow_name);
        self.index.update_with_retry(&index_key, &event.run_id, patch, self.config.max_index_retries).await?;
        pending::check_and_trigger_pending_steps(self, &analyzed, &event.run_id).await?;
        self.maybe_finalize(&analyzed, &event.run_id).await
    }

    async fn handle_await_registered(self: &Arc<Self>, event: &Event) -> anyhow::Result<()> {
        let Some(step_name) = event.step_name.clone() else { return Ok(()) };
        let position = event
            .data
            .get("position")
            .and_then(|v| v.as_str())
            .and_then(AwaitPosition::parse)
            .unwrap_or(AwaitPosition::Before);
        let config: AwaitConfig = serde_json::from_value(event.data.get("config").cloned().unwrap_or(Value::Null))?;
        let timeout_at = now_ms() + config.timeout_or_default().as_millis() as i64;
        let state = AwaitState {
            status: AwaitStatus::Awaiting,
            await_type: config.kind,
            registered_at: now_ms(),
            timeout_at: Some(timeout_at),
            position,
            trigger_data: None,
            config: serde_json::to_value(&config)?,
        };

        let mut awaiting_patch = serde_json::Map::new();
        awaiting_patch.insert(position.key(&step_name), serde_json::to_value(&state)?);
        let mut patch = serde_json::Map::new();
        patch.insert("status".to_string(), serde_json::to_value(RunStatus::Awaiting)?);
        patch.insert("awaitingSteps".to_string(), Value::Object(awaiting_patch));

        let index_key = flow_run_index_key(&event.flow_name);
        self.index
            .update_with_retry(&index_key, &event.run_id, Value::Object(patch), self.config.max_index_retries)
            .await?;
        Ok(())
    }

    async fn handle_await_resolution(self: &Arc<Self>, event: &Event, resolved_status: AwaitStatus) -> anyhow::Result<()> {
        let Some(analyzed) = self.registry.get(&event.flow_name) else { return Ok(()) };
        let Some(step_name) = event.step_name.clone() else { return Ok(()) };
        let position = event
            .data
            .get("position")
            .and_then(|v| v.as_str())
            .and_then(AwaitPosition::parse)
            .unwrap_or(AwaitPosition::Before);
        let key = position.key(&step_name);

        let index_key = flow_run_index_key(&event.flow_name);
        let Some(entry) = self.index.get(&index_key, &event.run_id).await? else { return Ok(()) };
        let run: FlowRun = serde_json::from_value(entry.metadata.clone())?;
        if run.status.is_terminal() || !run.awaiting_steps.contains_key(&key) {
            return Ok(());
        }

        let timeout_action = if resolved_status == AwaitStatus::Timeout {
            event.data.get("timeoutAction").and_then(|v| v.as_str()).unwrap_or("fail").to_string()
        } else {
            String::new()
        };
        // `continue` resolves the await rather than leaving it `Timeout` —
        // an await-state stuck in `Timeout` fails the whole run in
        // `completion::analyze`, which would make `continue` behave exactly
        // like `fail` (spec.md §4.2.5: "mark await resolved with
        // triggerData: null, re-evaluate pending steps").
        let is_continuing_timeout = resolved_status == AwaitStatus::Timeout && timeout_action == "continue";
        let persisted_status = if is_continuing_timeout { AwaitStatus::Resolved } else { resolved_status };
        let trigger_data = if is_continuing_timeout {
            Value::Null
        } else {
            event.data.get("triggerData").cloned().unwrap_or(Value::Null)
        };

        let mut state_patch = serde_json::Map::new();
        state_patch.insert("status".to_string(), serde_json::to_value(persisted_status)?);
        state_patch.insert("triggerData".to_string(), trigger_data.clone());
        let mut awaiting_patch = serde_json::Map::new();
        awaiting_patch.insert(key, Value::Object(state_patch));
        let mut patch = serde_json::Map::new();
        patch.insert("awaitingSteps".to_string(), Value::Object(awaiting_patch));
        self.index
            .update_with_retry(&index_key, &event.run_id, Value::Object(patch), self.config.max_index_retries)
            .await?;

        let should_fail = resolved_status == AwaitStatus::Timeout && timeout_action == "fail";
        if should_fail {
            self.publish_step_failed(&event.run_id, &event.flow_name, &step_name, &format!("Await timeout: {step_name}")).await;
        } else if position == AwaitPosition::Before {
            pending::enqueue_resumed_step(self, &analyzed, &event.run_id, &step_name, trigger_data).await?;
        }

        pending::check_and_trigger_pending_steps(self, &analyzed, &event.run_id).await?;
        self.maybe_finalize(&analyzed, &event.run_id).await
    }

    async fn handle_flow_cancel(self: &Arc<Self>, event: &Event) -> anyhow::Result<()> {
        self.finalize(&event.flow_name, &event.run_id, RunStatus::Canceled, None).await
    }

    async fn publish_step_failed(&self, run_id: &str, flow_name: &str, step_name: &str, reason: &str) {
        let event = Event::ingress(EventType::StepFailed, run_id.to_string(), flow_name.to_string(), json!({"reason": reason}))
            .with_step(step_name.to_string());
        self.bus.publish(event).await;
    }

    async fn maybe_finalize(self: &Arc<Self>, analyzed: &AnalyzedFlow, run_id: &str) -> anyhow::Result<()> {
        let index_key = flow_run_index_key(&analyzed.definition.name);
        let Some(entry) = self.index.get(&index_key, run_id).await? else { return Ok(()) };
        let run: FlowRun = serde_json::from_value(entry.metadata.clone())?;
        if run.status.is_terminal() {
            return Ok(());
        }
        let subject = flow_run_subject(run_id);
        let ctx = RunContext::load(self.stream.as_ref(), &subject).await?;

        match analyze(analyzed, &run, &ctx) {
            Outcome::Completed => self.finalize(&analyzed.definition.name, run_id, RunStatus::Completed, None).await,
            Outcome::Failed(reason) => {
                self.finalize(&analyzed.definition.name, run_id, RunStatus::Failed, Some(reason)).await
            }
            Outcome::Canceled => self.finalize(&analyzed.definition.name, run_id, RunStatus::Canceled, None).await,
            Outcome::Awaiting if run.status != RunStatus::Awaiting => {
                let patch = json!({"status": RunStatus::Awaiting});
                self.index.update_with_retry(&index_key, run_id, patch, self.config.max_index_retries).await?;
                Ok(())
            }
            Outcome::Running if run.status != RunStatus::Running => {
                let patch = json!({"status": RunStatus::Running});
                self.index.update_with_retry(&index_key, run_id, patch, self.config.max_index_retries).await?;
                Ok(())
            }
            Outcome::Awaiting | Outcome::Running => Ok(()),
        }
    }

    /// Move a run to a terminal status exactly once: cancel its
    /// outstanding scheduler jobs, persist the final status, and (for
    /// completion/failure — cancellation and stalling already have their
    /// own originating event) publish the terminal event. Guarded by an
    /// in-memory set released after `terminal_guard_delay` so a finalize
    /// triggered twice in close succession (e.g. a step.failed the cancel
    /// path raced with) is a no-op the second time.
    async fn finalize(self: &Arc<Self>, flow_name: &str, run_id: &str, status: RunStatus, reason: Option<String>) -> anyhow::Result<()> {
        {
            let mut guard = self.terminal_guard.lock();
            if !guard.insert(run_id.to_string()) {
                return Ok(());
            }
        }

        for job_id in self.scheduler.get_jobs_by_pattern(run_id) {
            let _ = self.scheduler.unschedule(&job_id).await;
        }

        let index_key = flow_run_index_key(flow_name);
        let patch = json!({
            "status": status,
            "completedAt": now_ms(),
            "lastError": reason,
        });
        self.index.update_with_retry(&index_key, run_id, patch, self.config.max_index_retries).await?;

        let terminal_event_type = match status {
            RunStatus::Completed => Some(EventType::FlowCompleted),
            RunStatus::Failed => Some(EventType::FlowFailed),
            _ => None,
        };
        if let Some(ty) = terminal_event_type {
            let event = Event::ingress(ty, run_id.to_string(), flow_name.to_string(), json!({"reason": reason}));
            self.bus.publish(event).await;
        }

        let this = self.clone();
        let run_id_owned = run_id.to_string();
        let delay = self.config.terminal_guard_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.terminal_guard.lock().remove(&run_id_owned);
        });

        Ok(())
    }

    /// Aggregate per-flow counters (spec.md §3.1 "Flow index"). Best-effort:
    /// a run canceled while awaiting is booked against `runningCount`
    /// regardless — see DESIGN.md.
    async fn stats_stage(self: Arc<Self>, event: Event) -> anyhow::Result<()> {
        if !event.is_persisted() || event.flow_name.is_empty() {
            return Ok(());
        }
        let key = flow_index_key();
        let _ = self
            .index
            .add(
                key,
                &event.flow_name,
                0.0,
                json!({
                    "flowName": event.flow_name,
                    "totalRuns": 0,
                    "runningCount": 0,
                    "awaitingCount": 0,
                    "completedCount": 0,
                    "failedCount": 0,
                    "canceledCount": 0,
                    "stalledCount": 0,
                }),
            )
            .await;

        let deltas: &[(&str, i64)] = match EventType::parse(event.event_type()) {
            Some(EventType::FlowStart) => &[("totalRuns", 1), ("runningCount", 1)],
            Some(EventType::FlowCompleted) => &[("runningCount", -1), ("completedCount", 1)],
            Some(EventType::FlowFailed) => &[("runningCount", -1), ("failedCount", 1)],
            Some(EventType::FlowCancel) => &[("runningCount", -1), ("canceledCount", 1)],
            Some(EventType::FlowStalled) => &[("runningCount", -1), ("stalledCount", 1)],
            Some(EventType::AwaitRegistered) => &[("runningCount", -1), ("awaitingCount", 1)],
            Some(EventType::AwaitResolved) | Some(EventType::AwaitTimeout) => &[("awaitingCount", -1), ("runningCount", 1)],
            _ => &[],
        };
        for (field, by) in deltas {
            let _ = self.index.increment(key, &event.flow_name, field, *by).await;
        }
        Ok(())
    }
}
