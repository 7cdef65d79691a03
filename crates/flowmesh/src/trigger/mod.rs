//! Trigger runtime and wiring (spec.md §4.3, §4.3.1).
//!
//! Mirrors `orchestrator`'s shape: an in-memory catalogue
//! ([`TriggerRuntime`]) plus a persistence/orchestration/stats pipeline
//! ([`TriggerWiring`]) wired onto the same bus. Starting a flow from a fired
//! trigger is delegated straight to [`crate::orchestrator::Orchestrator::start_flow`]
//! rather than re-deriving run creation and entry-step enqueue here — both
//! paths need exactly that, and the orchestrator already owns it.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};

use crate::adapters::{IndexStore, KvStore, StoreError, StreamStore};
use crate::bus::EventBus;
use crate::model::{now_ms, Event, EventType, JobKind, ScheduledJob, Subscription, SubscriptionMode, Trigger, TriggerType};
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::scheduler::{trigger_job_id, Scheduler, SchedulerError};
use crate::subjects::{trigger_index_key, trigger_stream_subject};
use crate::value::nest;

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// In-memory trigger catalogue plus the flowName -> trigger-name index
/// (spec.md §4.3 "Runtime"). Pure data structure; the event-driven
/// reactions to trigger lifecycle events live in [`TriggerWiring`].
pub struct TriggerRuntime {
    triggers: DashMap<String, Trigger>,
    /// flowName -> names of triggers it's subscribed to.
    flow_index: DashMap<String, std::collections::HashSet<String>>,
    kv: Arc<dyn KvStore>,
}

impl TriggerRuntime {
    pub fn new(kv: Arc<dyn KvStore>) -> Arc<Self> {
        Arc::new(Self {
            triggers: DashMap::new(),
            flow_index: DashMap::new(),
            kv,
        })
    }

    /// Insert or replace a trigger, reindexing its subscriptions.
    pub fn add_trigger(&self, trigger: Trigger) {
        for flow_name in trigger.subscriptions.keys() {
            self.flow_index.entry(flow_name.clone()).or_default().insert(trigger.name.clone());
        }
        self.triggers.insert(trigger.name.clone(), trigger);
    }

    pub fn remove_trigger(&self, name: &str) -> Option<Trigger> {
        let removed = self.triggers.remove(name).map(|(_, t)| t);
        if let Some(trigger) = &removed {
            for flow_name in trigger.subscriptions.keys() {
                if let Some(mut set) = self.flow_index.get_mut(flow_name) {
                    set.remove(name);
                }
            }
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Trigger> {
        self.triggers.get(name).map(|e| e.clone())
    }

    pub fn add_subscription(&self, trigger_name: &str, flow_name: &str, mode: SubscriptionMode) -> bool {
        let Some(mut trigger) = self.triggers.get_mut(trigger_name) else { return false };
        trigger.subscriptions.insert(
            flow_name.to_string(),
            Subscription {
                mode,
                registered_at: now_ms(),
            },
        );
        drop(trigger);
        self.flow_index.entry(flow_name.to_string()).or_default().insert(trigger_name.to_string());
        true
    }

    pub fn remove_subscription(&self, trigger_name: &str, flow_name: &str) -> bool {
        let Some(mut trigger) = self.triggers.get_mut(trigger_name) else { return false };
        let removed = trigger.subscriptions.remove(flow_name).is_some();
        drop(trigger);
        if removed {
            if let Some(mut set) = self.flow_index.get_mut(flow_name) {
                set.remove(trigger_name);
            }
        }
        removed
    }

    /// Active `(flowName, subscription)` pairs for `trigger_name`, in fan-out
    /// order for `trigger.fired` (spec.md §4.3.1).
    pub fn get_subscribed_flows(&self, trigger_name: &str) -> Vec<(String, Subscription)> {
        self.triggers
            .get(trigger_name)
            .map(|t| t.subscriptions.iter().map(|(f, s)| (f.clone(), s.clone())).collect())
            .unwrap_or_default()
    }

    pub fn get_all_subscriptions(&self) -> HashMap<String, Vec<String>> {
        self.flow_index.iter().map(|e| (e.key().clone(), e.value().iter().cloned().collect())).collect()
    }

    /// Follow a `__payloadRef` to its stored blob when the caller's payload
    /// was too large to pass through the bus; returns `payload` unchanged
    /// when no ref is present (spec.md §4.3 "resolvePayload").
    pub async fn resolve_payload(&self, payload: Value) -> Result<Value, StoreError> {
        let Some(reference) = payload.get("__payloadRef").and_then(|v| v.as_str()) else {
            return Ok(payload);
        };
        Ok(self.kv.get(reference).await?.unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone)]
pub struct TriggerWiringConfig {
    pub max_index_retries: u32,
}

impl Default for TriggerWiringConfig {
    fn default() -> Self {
        Self { max_index_retries: 5 }
    }
}

const TRIGGER_EVENT_TYPES: &[EventType] = &[
    EventType::TriggerRegistered,
    EventType::TriggerUpdated,
    EventType::TriggerFired,
    EventType::SubscriptionAdded,
    EventType::SubscriptionRemoved,
    EventType::TriggerDeleted,
];

/// Persistence/orchestration/stats pipeline for trigger lifecycle events
/// (spec.md §4.3 "Wiring"), wired onto the same [`EventBus`] the flow
/// orchestrator uses.
pub struct TriggerWiring {
    bus: EventBus,
    stream: Arc<dyn StreamStore>,
    index: Arc<dyn IndexStore>,
    scheduler: Arc<Scheduler>,
    runtime: Arc<TriggerRuntime>,
    orchestrator: Arc<Orchestrator>,
    config: TriggerWiringConfig,
}

impl TriggerWiring {
    pub fn new(
        bus: EventBus,
        stream: Arc<dyn StreamStore>,
        index: Arc<dyn IndexStore>,
        scheduler: Arc<Scheduler>,
        runtime: Arc<TriggerRuntime>,
        orchestrator: Arc<Orchestrator>,
        config: TriggerWiringConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            stream,
            index,
            scheduler,
            runtime,
            orchestrator,
            config,
        })
    }

    pub fn wire(self: &Arc<Self>) {
        for ty in TRIGGER_EVENT_TYPES {
            let this = self.clone();
            self.bus.on_type(ty.as_str(), move |event| {
                let this = this.clone();
                async move { this.persistence_stage(event).await }
            });
        }
        for ty in TRIGGER_EVENT_TYPES {
            let this = self.clone();
            self.bus.on_type(ty.as_str(), move |event| {
                let this = this.clone();
                async move { this.orchestration_entry(event).await }
            });
        }
        let this = self.clone();
        self.bus.on_type(EventType::TriggerFired.as_str(), move |event| {
            let this = this.clone();
            async move { this.stats_stage(event).await }
        });
    }

    // --- Public commands: each publishes an ingress event and lets the
    // pipeline stages below do the actual work, same shape as
    // `Orchestrator::start_flow`. ---

    pub async fn register_trigger(self: &Arc<Self>, trigger: Trigger) -> anyhow::Result<()> {
        let event = Event::ingress(
            EventType::TriggerRegistered,
            String::new(),
            String::new(),
            json!({"triggerName": trigger.name, "trigger": trigger}),
        );
        self.bus.publish(event).await;
        Ok(())
    }

    pub async fn update_trigger(self: &Arc<Self>, trigger: Trigger, patch: Value) -> anyhow::Result<()> {
        let event = Event::ingress(
            EventType::TriggerUpdated,
            String::new(),
            String::new(),
            json!({"triggerName": trigger.name, "trigger": trigger, "patch": patch}),
        );
        self.bus.publish(event).await;
        Ok(())
    }

    pub async fn fire_trigger(self: &Arc<Self>, trigger_name: &str, trigger_data: Value) -> anyhow::Result<()> {
        let event = Event::ingress(
            EventType::TriggerFired,
            String::new(),
            String::new(),
            json!({"triggerName": trigger_name, "triggerData": trigger_data}),
        );
        self.bus.publish(event).await;
        Ok(())
    }

    pub async fn add_subscription(self: &Arc<Self>, trigger_name: &str, flow_name: &str, mode: SubscriptionMode) -> anyhow::Result<()> {
        let event = Event::ingress(
            EventType::SubscriptionAdded,
            String::new(),
            String::new(),
            json!({"triggerName": trigger_name, "flowName": flow_name, "mode": mode}),
        );
        self.bus.publish(event).await;
        Ok(())
    }

    pub async fn remove_subscription(self: &Arc<Self>, trigger_name: &str, flow_name: &str) -> anyhow::Result<()> {
        let event = Event::ingress(
            EventType::SubscriptionRemoved,
            String::new(),
            String::new(),
            json!({"triggerName": trigger_name, "flowName": flow_name}),
        );
        self.bus.publish(event).await;
        Ok(())
    }

    pub async fn delete_trigger(self: &Arc<Self>, trigger_name: &str) -> anyhow::Result<()> {
        let event = Event::ingress(
            EventType::TriggerDeleted,
            String::new(),
            String::new(),
            json!({"triggerName": trigger_name}),
        );
        self.bus.publish(event).await;
        Ok(())
    }

    // --- Pipeline stages ---

    async fn persistence_stage(self: Arc<Self>, event: Event) -> anyhow::Result<()> {
        if event.is_persisted() {
            return Ok(());
        }
        let Some(name) = event.data.get("triggerName").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        let subject = trigger_stream_subject(name);
        let payload = serde_json::to_value(&event)?;
        let stream_event = self.stream.append(&subject, event.event_type(), payload).await?;
        let persisted = event.into_persisted(stream_event.id, stream_event.ts);
        self.bus.publish(persisted).await;
        Ok(())
    }

    async fn orchestration_entry(self: Arc<Self>, event: Event) -> anyhow::Result<()> {
        if !event.is_persisted() {
            return Ok(());
        }
        match EventType::parse(event.event_type()) {
            Some(EventType::TriggerRegistered) => self.handle_trigger_registered(&event).await,
            Some(EventType::TriggerUpdated) => self.handle_trigger_updated(&event).await,
            Some(EventType::TriggerFired) => self.handle_trigger_fired(&event).await,
            Some(EventType::SubscriptionAdded) => self.handle_subscription_added(&event).await,
            Some(EventType::SubscriptionRemoved) => self.handle_subscription_removed(&event).await,
            Some(EventType::TriggerDeleted) => self.handle_trigger_deleted(&event).await,
            _ => Ok(()),
        }
    }

    async fn handle_trigger_registered(self: &Arc<Self>, event: &Event) -> anyhow::Result<()> {
        let Some(name) = event.data.get("triggerName").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        let trigger: Trigger = serde_json::from_value(event.data.get("trigger").cloned().unwrap_or(Value::Null))?;
        self.runtime.add_trigger(trigger.clone());
        self.index.add(trigger_index_key(), name, now_ms() as f64, serde_json::to_value(&trigger)?).await?;
        if trigger.trigger_type == TriggerType::Schedule {
            self.schedule_trigger_job(&trigger).await?;
        }
        Ok(())
    }

    async fn handle_trigger_updated(self: &Arc<Self>, event: &Event) -> anyhow::Result<()> {
        let Some(name) = event.data.get("triggerName").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        let trigger: Trigger = serde_json::from_value(event.data.get("trigger").cloned().unwrap_or(Value::Null))?;
        let patch = event.data.get("patch").cloned().unwrap_or(Value::Null);

        self.runtime.add_trigger(trigger.clone());
        self.index
            .update_with_retry(trigger_index_key(), name, patch, self.config.max_index_retries)
            .await?;

        let _ = self.scheduler.unschedule(&trigger_job_id(name)).await;
        if trigger.trigger_type == TriggerType::Schedule {
            self.schedule_trigger_job(&trigger).await?;
        }
        Ok(())
    }

    async fn handle_trigger_fired(self: &Arc<Self>, event: &Event) -> anyhow::Result<()> {
        let Some(name) = event.data.get("triggerName").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        let Some(trigger) = self.runtime.get(name) else { return Ok(()) };
        let trigger_data = event.data.get("triggerData").cloned().unwrap_or(Value::Null);

        let mut started = 0u64;
        for (flow_name, subscription) in self.runtime.get_subscribed_flows(name) {
            match subscription.mode {
                SubscriptionMode::Auto => {
                    if self.start_flow_from_trigger(&flow_name, &trigger, trigger_data.clone()).await? {
                        started += 1;
                    }
                }
                SubscriptionMode::Manual => {
                    tracing::info!(trigger = %name, flow = %flow_name, "manual subscription, not auto-starting");
                }
            }
        }

        let _ = self.index.increment(trigger_index_key(), name, "stats.totalFires", 1).await;
        if started > 0 {
            let _ = self.index.increment(trigger_index_key(), name, "stats.totalFlowsStarted", started as i64).await;
        }
        Ok(())
    }

    async fn handle_subscription_added(self: &Arc<Self>, event: &Event) -> anyhow::Result<()> {
        let (Some(name), Some(flow_name)) = (
            event.data.get("triggerName").and_then(|v| v.as_str()),
            event.data.get("flowName").and_then(|v| v.as_str()),
        ) else {
            return Ok(());
        };
        let mode: SubscriptionMode = event
            .data
            .get("mode")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(SubscriptionMode::Auto);
        if self.runtime.add_subscription(name, flow_name, mode) {
            self.index.increment(trigger_index_key(), name, "stats.activeSubscribers", 1).await?;
        }
        Ok(())
    }

    async fn handle_subscription_removed(self: &Arc<Self>, event: &Event) -> anyhow::Result<()> {
        let (Some(name), Some(flow_name)) = (
            event.data.get("triggerName").and_then(|v| v.as_str()),
            event.data.get("flowName").and_then(|v| v.as_str()),
        ) else {
            return Ok(());
        };
        if self.runtime.remove_subscription(name, flow_name) {
            self.index.increment(trigger_index_key(), name, "stats.activeSubscribers", -1).await?;
        }
        Ok(())
    }

    async fn handle_trigger_deleted(self: &Arc<Self>, event: &Event) -> anyhow::Result<()> {
        let Some(name) = event.data.get("triggerName").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        self.index.delete(trigger_index_key(), name).await?;
        self.stream.delete(&trigger_stream_subject(name)).await?;
        self.runtime.remove_trigger(name);
        let _ = self.scheduler.unschedule(&trigger_job_id(name)).await;
        Ok(())
    }

    async fn stats_stage(self: Arc<Self>, event: Event) -> anyhow::Result<()> {
        if !event.is_persisted() {
            return Ok(());
        }
        let Some(name) = event.data.get("triggerName").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        let patch = nest("stats.lastFiredAt", json!(now_ms()))?;
        self.index.update_with_retry(trigger_index_key(), name, patch, self.config.max_index_retries).await?;
        let updated = Event::ingress(EventType::TriggerStatsUpdated, String::new(), String::new(), json!({"triggerName": name}));
        self.bus.publish(updated).await;
        Ok(())
    }

    /// spec.md §4.3.1: generate a `runId`, enqueue the entry step, publish
    /// `flow.start` — entirely delegated to the orchestrator's own
    /// `flow.start` entry point, which already does all three in that order.
    async fn start_flow_from_trigger(self: &Arc<Self>, flow_name: &str, trigger: &Trigger, trigger_data: Value) -> anyhow::Result<bool> {
        let mut input = serde_json::Map::new();
        input.insert("flowName".to_string(), json!(flow_name));
        input.insert("trigger".to_string(), json!({"name": trigger.name, "type": trigger.trigger_type, "data": trigger_data.clone()}));
        if let Value::Object(extra) = &trigger_data {
            for (k, v) in extra {
                input.insert(k.clone(), v.clone());
            }
        }

        match self.orchestrator.start_flow(flow_name, Value::Object(input)).await {
            Ok(_) => Ok(true),
            Err(OrchestratorError::UnknownFlow(_)) => {
                tracing::warn!(flow = %flow_name, trigger = %trigger.name, "trigger fired for unregistered flow");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn schedule_trigger_job(self: &Arc<Self>, trigger: &Trigger) -> anyhow::Result<()> {
        let Some(cfg) = &trigger.schedule else { return Ok(()) };
        let tz: chrono_tz::Tz = cfg.timezone.parse().unwrap_or(chrono_tz::UTC);
        let job = ScheduledJob::cron(
            trigger_job_id(&trigger.name),
            cfg.cron.clone(),
            tz,
            JobKind::TriggerFire {
                trigger_name: trigger.name.clone(),
            },
        );
        self.scheduler.schedule(job).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryQueue, InMemoryStore};
    use crate::model::{FlowDefinition, StepDefinition, TriggerStatus};
    use crate::orchestrator::OrchestratorConfig;
    use crate::registry::FlowRegistry;
    use crate::scheduler::SchedulerConfig;

    fn test_trigger(name: &str) -> Trigger {
        Trigger::new(name, TriggerType::Manual)
    }

    #[tokio::test]
    async fn add_subscription_updates_flow_index() {
        let store = InMemoryStore::new();
        let runtime = TriggerRuntime::new(Arc::new(store));
        runtime.add_trigger(test_trigger("t1"));
        assert!(runtime.add_subscription("t1", "f1", SubscriptionMode::Auto));
        assert_eq!(runtime.get_all_subscriptions().get("f1"), Some(&vec!["t1".to_string()]));
        assert!(runtime.remove_subscription("t1", "f1"));
        assert!(runtime.get_all_subscriptions().get("f1").map(Vec::is_empty).unwrap_or(true));
    }

    #[tokio::test]
    async fn resolve_payload_passes_through_without_ref() {
        let store = InMemoryStore::new();
        let runtime = TriggerRuntime::new(Arc::new(store));
        let payload = json!({"a": 1});
        assert_eq!(runtime.resolve_payload(payload.clone()).await.unwrap(), payload);
    }

    async fn test_wiring() -> (Arc<TriggerWiring>, Arc<InMemoryStore>, Arc<InMemoryQueue>) {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let bus = EventBus::new();
        let scheduler = Scheduler::new(bus.clone(), store.clone(), store.clone(), SchedulerConfig::default());
        let flow_registry = FlowRegistry::new();
        flow_registry.register(
            FlowDefinition::new("f1")
                .with_entry_step("E")
                .with_step("E", StepDefinition::new("q", "w")),
        );
        let orchestrator = Orchestrator::new(
            bus.clone(),
            store.clone(),
            store.clone(),
            queue.clone(),
            scheduler.clone(),
            flow_registry,
            OrchestratorConfig::default(),
        );
        orchestrator.wire();
        let runtime = TriggerRuntime::new(store.clone());
        let wiring = TriggerWiring::new(bus, store.clone(), store.clone(), scheduler, runtime, orchestrator, TriggerWiringConfig::default());
        wiring.wire();
        (wiring, store, queue)
    }

    #[tokio::test]
    async fn registering_a_trigger_creates_index_entry() {
        let (wiring, store, _queue) = test_wiring().await;
        wiring.register_trigger(test_trigger("t1")).await.unwrap();
        tokio::task::yield_now().await;
        assert!(IndexStore::get(store.as_ref(), trigger_index_key(), "t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn firing_a_trigger_with_auto_subscription_starts_a_flow() {
        let (wiring, store, queue) = test_wiring().await;
        wiring.register_trigger(test_trigger("t1")).await.unwrap();
        wiring.add_subscription("t1", "f1", SubscriptionMode::Auto).await.unwrap();
        tokio::task::yield_now().await;

        wiring.fire_trigger("t1", json!({"orderId": 7})).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

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

        let entry = IndexStore::get(store.as_ref(), trigger_index_key(), "t1").await.unwrap().unwrap();
        assert_eq!(entry.metadata.get("stats").and_then(|s| s.get("totalFlowsStarted")), Some(&json!(1)));
        let _ = queue;
        let _ = TriggerStatus::Active;
    }
}
