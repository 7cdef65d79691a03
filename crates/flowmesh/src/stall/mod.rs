//! Stall detector: per-flow outer deadlines and startup recovery
//! (spec.md §4.6).
//!
//! Subscribes to the same step-lifecycle event types the orchestrator
//! reacts to and reschedules `stall-timeout:{runId}` to `now + stallTimeout`
//! on each one, independently of the orchestrator's own pipeline. This keeps
//! the detector a self-contained component wired onto the bus the same way
//! `TriggerWiring` is, rather than threading deadline bookkeeping through
//! `Orchestrator`'s handlers.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapters::IndexStore;
use crate::bus::EventBus;
use crate::model::{now_ms, Event, EventType, FlowRun, JobKind, RunStatus, ScheduledJob};
use crate::registry::FlowRegistry;
use crate::scheduler::{stall_job_id, Scheduler, SchedulerError, StallFireHandler};
use crate::subjects::{flow_index_key, flow_run_index_key};

const RESCHEDULE_ON: &[EventType] = &[
    EventType::FlowStart,
    EventType::StepStarted,
    EventType::StepCompleted,
    EventType::StepFailed,
    EventType::StepRetry,
    EventType::Emit,
    EventType::AwaitRegistered,
    EventType::AwaitResolved,
    EventType::AwaitTimeout,
];

/// Owns the per-run deadline timer and the terminal `flow.stalled`
/// transition. Registered with the [`Scheduler`] as its [`StallFireHandler`].
pub struct StallDetector {
    bus: EventBus,
    index: Arc<dyn IndexStore>,
    scheduler: Arc<Scheduler>,
    registry: Arc<FlowRegistry>,
    max_index_retries: u32,
}

impl StallDetector {
    pub fn new(bus: EventBus, index: Arc<dyn IndexStore>, scheduler: Arc<Scheduler>, registry: Arc<FlowRegistry>, max_index_retries: u32) -> Arc<Self> {
        Arc::new(Self {
            bus,
            index,
            scheduler,
            registry,
            max_index_retries,
        })
    }

    /// Subscribe the rescheduling side (spec.md §4.6.1 "on any step
    /// lifecycle event ... reschedules"). Call once at startup, after
    /// `Orchestrator::wire`. The fire side is wired separately via
    /// `Scheduler::set_stall_handler`.
    pub fn wire(self: &Arc<Self>) {
        for ty in RESCHEDULE_ON {
            let this = self.clone();
            self.bus.on_type(ty.as_str(), move |event| {
                let this = this.clone();
                async move { this.reschedule(&event).await }
            });
        }
    }

    async fn reschedule(self: &Arc<Self>, event: &Event) -> anyhow::Result<()> {
        if !event.is_persisted() || event.run_id.is_empty() {
            return Ok(());
        }
        let Some(analyzed) = self.registry.get(&event.flow_name) else { return Ok(()) };
        let job_id = stall_job_id(&event.run_id);
        let _ = self.scheduler.unschedule(&job_id).await;
        let execute_at = now_ms() + analyzed.stall_timeout.as_millis() as i64;
        let job = ScheduledJob::one_time(
            job_id,
            execute_at,
            JobKind::StallTimeout {
                run_id: event.run_id.clone(),
                flow_name: event.flow_name.clone(),
            },
        );
        self.scheduler.schedule(job).await?;
        Ok(())
    }

    /// spec.md §4.6.2 startup recovery: reconcile every known flow's run
    /// index against `running`/`awaiting` status, plus the flow-stats index.
    pub async fn recover(self: &Arc<Self>) -> Result<(), SchedulerError> {
        for flow_name in self.registry.flow_names() {
            let index_key = flow_run_index_key(&flow_name);
            let entries = self
                .index
                .read(&index_key, crate::adapters::ReadDirection::Ascending, 0, usize::MAX)
                .await
                .map_err(SchedulerError::from)?;

            let mut running = 0i64;
            let mut awaiting = 0i64;
            for entry in entries {
                let Ok(run) = serde_json::from_value::<FlowRun>(entry.metadata) else { continue };
                if run.status != RunStatus::Running && run.status != RunStatus::Awaiting {
                    continue;
                }
                self.recover_run(&flow_name, &run).await?;
                match run.status {
                    RunStatus::Running => running += 1,
                    RunStatus::Awaiting => awaiting += 1,
                    _ => {}
                }
            }
            self.reconcile_flow_stats(&flow_name, running, awaiting).await;
        }
        Ok(())
    }

    async fn recover_run(self: &Arc<Self>, flow_name: &str, run: &FlowRun) -> Result<(), SchedulerError> {
        let now = now_ms();
        let mut overdue = false;
        let mut active_valid = false;
        for state in run.awaiting_steps.values() {
            if state.status != crate::model::AwaitStatus::Awaiting {
                continue;
            }
            match state.timeout_at {
                None => active_valid = true,
                Some(t) if t < now => overdue = true,
                Some(_) => active_valid = true,
            }
        }

        if overdue {
            self.mark_stalled(flow_name, run, "await timeout missed during restart").await?;
        } else if active_valid {
            if run.status != RunStatus::Awaiting {
                let index_key = flow_run_index_key(flow_name);
                let patch = json!({"status": RunStatus::Awaiting});
                self.index
                    .update_with_retry(&index_key, &run.run_id, patch, self.max_index_retries)
                    .await
                    .map_err(SchedulerError::from)?;
            }
        } else {
            self.mark_stalled(flow_name, run, "Server restart - flow state lost").await?;
        }
        Ok(())
    }

    async fn mark_stalled(self: &Arc<Self>, flow_name: &str, run: &FlowRun, reason: &str) -> Result<(), SchedulerError> {
        self.on_stall_fire_with_reason(run.run_id.clone(), flow_name.to_string(), reason.to_string()).await;
        Ok(())
    }

    async fn reconcile_flow_stats(&self, flow_name: &str, running: i64, awaiting: i64) {
        let key = flow_index_key();
        let Ok(Some(entry)) = self.index.get(key, flow_name).await else { return };
        let patch = json!({"runningCount": running, "awaitingCount": awaiting});
        let _ = self.index.update_with_retry(key, flow_name, patch, self.max_index_retries).await;
        let _ = entry;
    }

    /// Shared implementation behind both the scheduled-job fire path and
    /// recovery's direct calls, which carry different `stallReason` text.
    async fn on_stall_fire_with_reason(self: &Arc<Self>, run_id: String, flow_name: String, reason: String) {
        let index_key = flow_run_index_key(&flow_name);
        let Ok(Some(entry)) = self.index.get(&index_key, &run_id).await else { return };
        let Ok(run) = serde_json::from_value::<FlowRun>(entry.metadata) else { return };
        if run.status.is_terminal() {
            return;
        }

        let patch = json!({
            "status": RunStatus::Stalled,
            "previousStatus": run.status,
            "stallReason": reason,
            "completedAt": now_ms(),
        });
        if self
            .index
            .update_with_retry(&index_key, &run_id, patch, self.max_index_retries)
            .await
            .is_err()
        {
            return;
        }

        for job_id in self.scheduler.get_jobs_by_pattern(&run_id) {
            let _ = self.scheduler.unschedule(&job_id).await;
        }

        let event = Event::ingress(EventType::FlowStalled, run_id, flow_name, json!({"reason": reason}));
        self.bus.publish(event).await;
    }
}

#[async_trait]
impl StallFireHandler for StallDetector {
    async fn on_stall_fire(&self, run_id: String, flow_name: String) {
        let this = Arc::new(Self {
            bus: self.bus.clone(),
            index: self.index.clone(),
            scheduler: self.scheduler.clone(),
            registry: self.registry.clone(),
            max_index_retries: self.max_index_retries,
        });
        this.on_stall_fire_with_reason(run_id, flow_name, "stall timeout exceeded".to_string()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryQueue, InMemoryStore};
    use crate::await_subsystem::AwaitKind;
    use crate::model::{AwaitState, AwaitStatus, FlowDefinition, StepDefinition};
    use crate::orchestrator::{Orchestrator, OrchestratorConfig};
    use crate::scheduler::SchedulerConfig;
    use std::collections::HashMap;
    use std::time::Duration;

    fn flow_with_stall_timeout() -> FlowDefinition {
        FlowDefinition::new("f1")
            .with_entry_step("E")
            .with_step("E", StepDefinition::new("q", "w").with_step_timeout(Duration::from_millis(5)))
    }

    async fn setup() -> (Arc<StallDetector>, Arc<InMemoryStore>, Arc<FlowRegistry>) {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let bus = EventBus::new();
        let scheduler = Scheduler::new(bus.clone(), store.clone(), store.clone(), SchedulerConfig::default());
        let registry = FlowRegistry::new();
        registry.register(flow_with_stall_timeout());
        let orchestrator = Orchestrator::new(bus.clone(), store.clone(), store.clone(), queue, scheduler.clone(), registry.clone(), OrchestratorConfig::default());
        orchestrator.wire();
        let detector = StallDetector::new(bus, store.clone(), scheduler, registry.clone(), 5);
        detector.wire();
        scheduler.set_stall_handler(detector.clone());
        (detector, store, registry)
    }

    #[tokio::test]
    async fn recovery_marks_running_with_no_await_as_stalled() {
        let (detector, store, _registry) = setup().await;
        let run = FlowRun::new("f1-1-000001", "f1", now_ms());
        store.add(&flow_run_index_key("f1"), &run.run_id, 0.0, serde_json::to_value(&run).unwrap()).await.unwrap();

        detector.recover().await.unwrap();

        let entry = store.get(&flow_run_index_key("f1"), &run.run_id).await.unwrap().unwrap();
        let recovered: FlowRun = serde_json::from_value(entry.metadata).unwrap();
        assert_eq!(recovered.status, RunStatus::Stalled);
        assert_eq!(recovered.stall_reason.as_deref(), Some("Server restart - flow state lost"));
    }

    #[tokio::test]
    async fn recovery_forces_awaiting_status_on_active_valid_await() {
        let (detector, store, _registry) = setup().await;
        let mut run = FlowRun::new("f1-1-000002", "f1", now_ms());
        run.status = RunStatus::Running;
        run.awaiting_steps.insert(
            "E:before".to_string(),
            AwaitState {
                status: AwaitStatus::Awaiting,
                await_type: AwaitKind::Time,
                registered_at: now_ms(),
                timeout_at: Some(now_ms() + 60_000),
                position: crate::model::AwaitPosition::Before,
                trigger_data: None,
                config: Value::Null,
            },
        );
        store.add(&flow_run_index_key("f1"), &run.run_id, 0.0, serde_json::to_value(&run).unwrap()).await.unwrap();

        detector.recover().await.unwrap();

        let entry = store.get(&flow_run_index_key("f1"), &run.run_id).await.unwrap().unwrap();
        let recovered: FlowRun = serde_json::from_value(entry.metadata).unwrap();
        assert_eq!(recovered.status, RunStatus::Awaiting);
    }

    #[tokio::test]
    async fn recovery_marks_overdue_await_as_stalled() {
        let (detector, store, _registry) = setup().await;
        let mut run = FlowRun::new("f1-1-000003", "f1", now_ms());
        run.status = RunStatus::Awaiting;
        run.awaiting_steps.insert(
            "E:before".to_string(),
            AwaitState {
                status: AwaitStatus::Awaiting,
                await_type: AwaitKind::Time,
                registered_at: now_ms(),
                timeout_at: Some(now_ms() - 1_000),
                position: crate::model::AwaitPosition::Before,
                trigger_data: None,
                config: Value::Null,
            },
        );
        store.add(&flow_run_index_key("f1"), &run.run_id, 0.0, serde_json::to_value(&run).unwrap()).await.unwrap();

        detector.recover().await.unwrap();

        let entry = store.get(&flow_run_index_key("f1"), &run.run_id).await.unwrap().unwrap();
        let recovered: FlowRun = serde_json::from_value(entry.metadata).unwrap();
        assert_eq!(recovered.status, RunStatus::Stalled);
        assert_eq!(recovered.stall_reason.as_deref(), Some("await timeout missed during restart"));
        let _: HashMap<String, String> = HashMap::new();
    }

    #[tokio::test]
    async fn firing_scheduled_stall_job_transitions_running_to_stalled() {
        let (detector, store, _registry) = setup().await;
        let mut run = FlowRun::new("f1-1-000004", "f1", now_ms());
        run.status = RunStatus::Running;
        store.add(&flow_run_index_key("f1"), &run.run_id, 0.0, serde_json::to_value(&run).unwrap()).await.unwrap();

        StallFireHandler::on_stall_fire(detector.as_ref(), run.run_id.clone(), "f1".to_string()).await;

        let entry = store.get(&flow_run_index_key("f1"), &run.run_id).await.unwrap().unwrap();
        let recovered: FlowRun = serde_json::from_value(entry.metadata).unwrap();
        assert_eq!(recovered.status, RunStatus::Stalled);
    }
}
