//! Top-level wiring: constructs every component against one set of adapters
//! and exposes the public command surface, with no process-global state
//! (spec.md §9 design note "no globals" — every component here is an owned
//! `Arc`, reachable only through a [`Runtime`] handle).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::adapters::{IndexStore, KvStore, Queue, StreamStore};
use crate::await_subsystem::AwaitSubsystem;
use crate::bus::EventBus;
use crate::model::{FlowDefinition, SubscriptionMode, Trigger};
use crate::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError};
use crate::registry::FlowRegistry;
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerError};
use crate::stall::StallDetector;
use crate::trigger::{TriggerError, TriggerRuntime, TriggerWiring, TriggerWiringConfig};

/// Tunable knobs spanning every component (spec.md §4.2.9, §4.4, §4.5,
/// §4.6; SPEC_FULL.md §3.4). Grouped here so a caller configures the whole
/// runtime from one struct instead of threading individual fields through
/// each constructor.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_index_retries: u32,
    pub lane_idle_eviction: Duration,
    pub terminal_guard_delay: Duration,
    pub scheduler_lock_ttl: Duration,
    pub scheduler_lock_renew_fraction: f64,
    pub scheduler_recovery_scan_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let orchestrator = OrchestratorConfig::default();
        let scheduler = SchedulerConfig::default();
        Self {
            max_index_retries: orchestrator.max_index_retries,
            lane_idle_eviction: orchestrator.lane_idle_eviction,
            terminal_guard_delay: orchestrator.terminal_guard_delay,
            scheduler_lock_ttl: scheduler.lock_ttl,
            scheduler_lock_renew_fraction: scheduler.lock_renew_fraction,
            scheduler_recovery_scan_limit: scheduler.recovery_scan_limit,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Every orchestration component constructed against one adapter set. This
/// is the crate's single entry point: callers register flows and triggers,
/// call `start`, and thereafter only interact through `start_flow` /
/// `TriggerWiring`'s command methods (reached via the `triggers` field).
pub struct Runtime {
    pub bus: EventBus,
    pub registry: Arc<FlowRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub orchestrator: Arc<Orchestrator>,
    pub awaits: Arc<AwaitSubsystem>,
    pub trigger_runtime: Arc<TriggerRuntime>,
    pub triggers: Arc<TriggerWiring>,
    pub stall: Arc<StallDetector>,
}

impl Runtime {
    pub fn new(stream: Arc<dyn StreamStore>, index: Arc<dyn IndexStore>, kv: Arc<dyn KvStore>, queue: Arc<dyn Queue>, config: RuntimeConfig) -> Arc<Self> {
        let bus = EventBus::new();
        let registry = FlowRegistry::new();

        let scheduler_config = SchedulerConfig {
            lock_ttl: config.scheduler_lock_ttl,
            lock_renew_fraction: config.scheduler_lock_renew_fraction,
            recovery_scan_limit: config.scheduler_recovery_scan_limit,
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::new(bus.clone(), index.clone(), kv.clone(), scheduler_config);

        let orchestrator_config = OrchestratorConfig {
            max_index_retries: config.max_index_retries,
            lane_idle_eviction: config.lane_idle_eviction,
            terminal_guard_delay: config.terminal_guard_delay,
        };
        let orchestrator = Orchestrator::new(bus.clone(), stream.clone(), index.clone(), queue, scheduler.clone(), registry.clone(), orchestrator_config);

        let awaits = AwaitSubsystem::new(bus.clone(), scheduler.clone());

        let trigger_runtime = TriggerRuntime::new(kv.clone());
        let triggers = TriggerWiring::new(
            bus.clone(),
            stream,
            index.clone(),
            scheduler.clone(),
            trigger_runtime.clone(),
            orchestrator.clone(),
            TriggerWiringConfig {
                max_index_retries: config.max_index_retries,
            },
        );

        let stall = StallDetector::new(bus.clone(), index, scheduler.clone(), registry.clone(), config.max_index_retries);

        Arc::new(Self {
            bus,
            registry,
            scheduler,
            orchestrator,
            awaits,
            trigger_runtime,
            triggers,
            stall,
        })
    }

    /// Wire every component's bus handlers and register the stall/fire
    /// callback, then run scheduler + stall-detector startup recovery
    /// (spec.md §4.4.4, §4.6.2). Call once before accepting any flow starts
    /// or trigger fires.
    pub async fn start(self: &Arc<Self>) -> Result<(), RuntimeError> {
        self.orchestrator.wire();
        self.awaits.wire();
        self.triggers.wire();
        self.stall.wire();
        self.scheduler.set_stall_handler(self.stall.clone());

        self.scheduler.start().await?;
        self.stall.recover().await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), RuntimeError> {
        self.scheduler.stop().await?;
        Ok(())
    }

    pub fn register_flow(&self, definition: FlowDefinition) {
        self.registry.register(definition);
    }

    pub async fn start_flow(self: &Arc<Self>, flow_name: &str, input: Value) -> Result<String, RuntimeError> {
        Ok(self.orchestrator.start_flow(flow_name, input).await?)
    }

    pub async fn register_trigger(self: &Arc<Self>, trigger: Trigger) -> Result<(), RuntimeError> {
        self.triggers.register_trigger(trigger).await?;
        Ok(())
    }

    pub async fn fire_trigger(self: &Arc<Self>, trigger_name: &str, trigger_data: Value) -> Result<(), RuntimeError> {
        self.triggers.fire_trigger(trigger_name, trigger_data).await?;
        Ok(())
    }

    pub async fn subscribe_flow_to_trigger(self: &Arc<Self>, trigger_name: &str, flow_name: &str, mode: SubscriptionMode) -> Result<(), RuntimeError> {
        self.triggers.add_subscription(trigger_name, flow_name, mode).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryQueue, InMemoryStore};
    use crate::model::{StepDefinition, TriggerType};
    use serde_json::json;

    async fn test_runtime() -> (Arc<Runtime>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let runtime = Runtime::new(store.clone(), store.clone(), store.clone(), queue, RuntimeConfig::default());
        runtime.start().await.unwrap();
        (runtime, store)
    }

    #[tokio::test]
    async fn starting_an_unregistered_flow_errors() {
        let (runtime, _store) = test_runtime().await;
        let err = runtime.start_flow("missing", json!({})).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn registering_a_flow_then_starting_it_succeeds() {
        let (runtime, _store) = test_runtime().await;
        runtime.register_flow(FlowDefinition::new("f1").with_entry_step("E").with_step("E", StepDefinition::new("q", "w")));
        let run_id = runtime.start_flow("f1", json!({"x": 1})).await.unwrap();
        assert!(run_id.starts_with("f1-"));
    }

    #[tokio::test]
    async fn a_manual_trigger_fan_out_starts_subscribed_flows() {
        let (runtime, store) = test_runtime().await;
        runtime.register_flow(FlowDefinition::new("f1").with_entry_step("E").with_step("E", StepDefinition::new("q", "w")));
        runtime.register_trigger(Trigger::new("t1", TriggerType::Manual)).await.unwrap();
        runtime.subscribe_flow_to_trigger("t1", "f1", SubscriptionMode::Auto).await.unwrap();
        tokio::task::yield_now().await;

        runtime.fire_trigger("t1", json!({"orderId": 1})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let runs = IndexStore::read(
            store.as_ref(),
            &crate::subjects::flow_run_index_key("f1"),
            crate::adapters::ReadDirection::Ascending,
            0,
            10,
        )
        .await
        .unwrap();
        assert_eq!(runs.len(), 1);
    }
}
