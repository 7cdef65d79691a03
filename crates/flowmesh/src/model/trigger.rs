//! Trigger and subscription entities (spec.md §3.1 "Trigger").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How a trigger fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Webhook,
    Schedule,
    Event,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Active,
    Disabled,
}

/// Cron schedule plus IANA timezone, carried by `schedule`-type triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    pub cron: String,
    pub timezone: String,
}

/// Webhook path/secret, carried by `webhook`-type triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub path: String,
    pub secret: Option<String>,
}

/// Binding mode of a flow subscribed to a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub mode: SubscriptionMode,
    pub registered_at: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerStats {
    pub total_fires: u64,
    pub total_flows_started: u64,
    pub active_subscribers: u64,
    pub last_fired_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub name: String,
    pub trigger_type: TriggerType,
    pub status: TriggerStatus,
    pub schedule: Option<ScheduleConfig>,
    pub webhook: Option<WebhookConfig>,
    pub stats: TriggerStats,
    /// flowName -> subscription.
    pub subscriptions: HashMap<String, Subscription>,
}

impl Trigger {
    pub fn new(name: impl Into<String>, trigger_type: TriggerType) -> Self {
        Self {
            name: name.into(),
            trigger_type,
            status: TriggerStatus::Active,
            schedule: None,
            webhook: None,
            stats: TriggerStats::default(),
            subscriptions: HashMap::new(),
        }
    }

    pub fn with_schedule(mut self, cron: impl Into<String>, timezone: impl Into<String>) -> Self {
        self.schedule = Some(ScheduleConfig {
            cron: cron.into(),
            timezone: timezone.into(),
        });
        self
    }

    pub fn with_webhook(mut self, path: impl Into<String>, secret: Option<String>) -> Self {
        self.webhook = Some(WebhookConfig {
            path: path.into(),
            secret,
        });
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == TriggerStatus::Active
    }
}
