//! Data model: flow definitions, runs, events, triggers, and scheduled jobs
//! (spec.md §3).

pub mod event;
pub mod flow;
pub mod job;
pub mod run;
pub mod trigger;

pub use event::{now_ms, Event, EventType, PersistedMeta};
pub use flow::{AnalyzedFlow, FlowDefinition, StepDefinition};
pub use job::{AwaitResolveType, JobKind, JobMetadata, JobSchedule, ScheduledJob};
pub use run::{new_run_id, AwaitPosition, AwaitState, AwaitStatus, FlowRun, RunStatus};
pub use trigger::{
    ScheduleConfig, Subscription, SubscriptionMode, Trigger, TriggerStats, TriggerStatus, TriggerType,
    WebhookConfig,
};
