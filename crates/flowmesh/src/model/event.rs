//! Event types and the envelope carried on the [`crate::bus::EventBus`]
//! (spec.md §3.1, §4.1).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The full set of event types the orchestrator understands (spec.md §3.1).
///
/// Dotted names (`"flow.start"`) don't fit serde's `rename_all`, so
/// (de)serialization and display both go through explicit `as_str`/`parse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    FlowStart,
    FlowCompleted,
    FlowFailed,
    FlowCancel,
    FlowStalled,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepRetry,
    Emit,
    Log,
    State,
    AwaitRegistered,
    AwaitResolved,
    AwaitTimeout,
    TriggerRegistered,
    TriggerUpdated,
    TriggerDeleted,
    TriggerFired,
    SubscriptionAdded,
    SubscriptionRemoved,
    /// Published by the stats stage after updating per-flow counters.
    FlowStatsUpdated,
    /// Published by the trigger wiring's stats stage.
    TriggerStatsUpdated,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::FlowStart => "flow.start",
            EventType::FlowCompleted => "flow.completed",
            EventType::FlowFailed => "flow.failed",
            EventType::FlowCancel => "flow.cancel",
            EventType::FlowStalled => "flow.stalled",
            EventType::StepStarted => "step.started",
            EventType::StepCompleted => "step.completed",
            EventType::StepFailed => "step.failed",
            EventType::StepRetry => "step.retry",
            EventType::Emit => "emit",
            EventType::Log => "log",
            EventType::State => "state",
            EventType::AwaitRegistered => "await.registered",
            EventType::AwaitResolved => "await.resolved",
            EventType::AwaitTimeout => "await.timeout",
            EventType::TriggerRegistered => "trigger.registered",
            EventType::TriggerUpdated => "trigger.updated",
            EventType::TriggerDeleted => "trigger.deleted",
            EventType::TriggerFired => "trigger.fired",
            EventType::SubscriptionAdded => "subscription.added",
            EventType::SubscriptionRemoved => "subscription.removed",
            EventType::FlowStatsUpdated => "flow.stats.updated",
            EventType::TriggerStatsUpdated => "trigger.stats.updated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "flow.start" => EventType::FlowStart,
            "flow.completed" => EventType::FlowCompleted,
            "flow.failed" => EventType::FlowFailed,
            "flow.cancel" => EventType::FlowCancel,
            "flow.stalled" => EventType::FlowStalled,
            "step.started" => EventType::StepStarted,
            "step.completed" => EventType::StepCompleted,
            "step.failed" => EventType::StepFailed,
            "step.retry" => EventType::StepRetry,
            "emit" => EventType::Emit,
            "log" => EventType::Log,
            "state" => EventType::State,
            "await.registered" => EventType::AwaitRegistered,
            "await.resolved" => EventType::AwaitResolved,
            "await.timeout" => EventType::AwaitTimeout,
            "trigger.registered" => EventType::TriggerRegistered,
            "trigger.updated" => EventType::TriggerUpdated,
            "trigger.deleted" => EventType::TriggerDeleted,
            "trigger.fired" => EventType::TriggerFired,
            "subscription.added" => EventType::SubscriptionAdded,
            "subscription.removed" => EventType::SubscriptionRemoved,
            "flow.stats.updated" => EventType::FlowStatsUpdated,
            "trigger.stats.updated" => EventType::TriggerStatsUpdated,
            _ => return None,
        })
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EventType::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("unknown event type {s:?}")))
    }
}

/// Metadata present only on the persisted copy of an event: adapter-assigned
/// stream id and timestamp. Its presence/absence is exactly what
/// distinguishes a persisted event from the ingress copy a publisher first
/// hands to the bus (spec.md §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedMeta {
    pub id: i64,
    pub ts: i64,
}

/// The event envelope dispatched on the [`crate::bus::EventBus`].
///
/// `persisted` is `None` for an ingress event (no id/ts yet) and `Some` once
/// the persistence stage has appended it to the run stream and republished
/// it — handlers pattern-match on this to decide whether they act on the
/// ingress or the persisted copy (spec.md §4.1, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub run_id: String,
    pub flow_name: String,
    pub step_name: Option<String>,
    pub step_id: Option<String>,
    pub attempt: Option<u32>,
    pub data: Value,
    pub persisted: Option<PersistedMeta>,
}

impl Event {
    /// Build an ingress event — no `persisted` metadata yet.
    pub fn ingress(event_type: EventType, run_id: String, flow_name: String, data: Value) -> Self {
        Self {
            event_type,
            run_id,
            flow_name,
            step_name: None,
            step_id: None,
            attempt: None,
            data,
            persisted: None,
        }
    }

    pub fn with_step(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = Some(step_name.into());
        self
    }

    pub fn with_step_id(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn event_type(&self) -> &'static str {
        self.event_type.as_str()
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted.is_some()
    }

    /// Stamp this event with persistence metadata, as the persistence stage
    /// does immediately before republishing (spec.md §4.2 "Persistence").
    pub fn into_persisted(mut self, id: i64, ts: i64) -> Self {
        self.persisted = Some(PersistedMeta { id, ts });
        self
    }
}

/// Unix-ms "now", the timestamp unit used throughout run metadata.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
