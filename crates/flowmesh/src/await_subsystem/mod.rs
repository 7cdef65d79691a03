//! Await subsystem: registers await patterns, schedules timeouts, and
//! resumes suspended steps on resolution (spec.md §4.5).
//!
//! Four kinds share one protocol: a registration produces one
//! `await.registered` event; resolution produces one `await.resolved`, or a
//! timeout produces `await.timeout`. This module is the "issuer" referred
//! to in spec.md §4.2.4 — the party responsible for scheduling the
//! follow-up job once a registration has been persisted.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::EventBus;
use crate::model::run::AwaitPosition;
use crate::model::{now_ms, AwaitResolveType, Event, EventType, JobKind, ScheduledJob};
use crate::scheduler::{await_job_id, next_cron_occurrence, Scheduler, SchedulerError};

/// Which external signal an await suspends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitKind {
    Time,
    Schedule,
    Webhook,
    Event,
}

/// What happens when an await's deadline passes unresolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    Fail,
    Continue,
    /// Reserved; not implemented (spec.md §9 Open Questions). Registering
    /// an await with this action is rejected at registration time.
    Retry,
}

/// Opaque-to-the-orchestrator await configuration, carried on the step
/// definition's `awaitBefore`/`awaitAfter` (spec.md §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwaitConfig {
    pub kind: AwaitKind,
    pub delay: Option<Duration>,
    pub timeout: Option<Duration>,
    pub timeout_action: TimeoutAction,
    pub cron: Option<String>,
    pub timezone: Option<String>,
    /// Dot-path event name this await resolves on, for `kind == Event`
    /// (matched against the `emit` event's `data.name`, scoped to the same
    /// run — see DESIGN.md for why this crate reads "named event pattern"
    /// as the run-local emit mechanism rather than a separate channel).
    pub event_pattern: Option<String>,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

impl AwaitConfig {
    /// Conservative estimate used by [`crate::model::flow::AnalyzedFlow`]'s
    /// `stall_timeout` computation, before any run of the flow exists.
    pub fn timeout_or_default(&self) -> Duration {
        match self.kind {
            AwaitKind::Time => self.delay.unwrap_or_default(),
            AwaitKind::Schedule | AwaitKind::Webhook | AwaitKind::Event => self.timeout.unwrap_or(DEFAULT_TIMEOUT),
        }
    }

    fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AwaitError {
    #[error("timeoutAction: retry is reserved and not implemented")]
    RetryNotImplemented,
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("invalid cron in schedule-kind await: {0}")]
    InvalidCron(String),
}

struct PendingEventAwait {
    run_id: String,
    flow_name: String,
    step_name: String,
    position: AwaitPosition,
    pattern: String,
    timeout_job_id: String,
}

/// Owns the side effects of await registration/resolution: scheduling the
/// scheduler jobs that drive time/schedule resolution and webhook/event
/// timeouts, and matching `emit` events against registered event-kind
/// awaits.
pub struct AwaitSubsystem {
    bus: EventBus,
    scheduler: Arc<Scheduler>,
    /// run_id -> pending event-kind awaits for that run.
    event_waiters: DashMap<String, Vec<PendingEventAwait>>,
}

impl AwaitSubsystem {
    pub fn new(bus: EventBus, scheduler: Arc<Scheduler>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            scheduler,
            event_waiters: DashMap::new(),
        })
    }

    /// Wire this subsystem's handlers onto the bus. Call once at startup.
    pub fn wire(self: &Arc<Self>) {
        let this = self.clone();
        self.bus.on_type(EventType::AwaitRegistered.as_str(), move |event| {
            let this = this.clone();
            async move { this.on_registered(event).await }
        });

        let this = self.clone();
        self.bus.on_type(EventType::Emit.as_str(), move |event| {
            let this = this.clone();
            async move { this.on_emit(event).await }
        });
    }

    async fn on_registered(&self, event: Event) -> Result<(), anyhow::Error> {
        if event.is_persisted() {
            return Ok(());
        }
        let Some(step_name) = event.step_name.clone() else {
            return Ok(());
        };
        let position = event
            .data
            .get("position")
            .and_then(|v| v.as_str())
            .and_then(AwaitPosition::parse)
            .unwrap_or(AwaitPosition::Before);
        let config: AwaitConfig = serde_json::from_value(event.data.get("config").cloned().unwrap_or(Value::Null))
            .map_err(|e| anyhow::anyhow!("invalid await config: {e}"))?;

        if config.timeout_action == TimeoutAction::Retry {
            return Err(AwaitError::RetryNotImplemented.into());
        }

        self.register(&event.run_id, &event.flow_name, &step_name, position, &config).await?;
        Ok(())
    }

    /// Schedule the follow-up job for a freshly-registered await.
    async fn register(
        &self,
        run_id: &str,
        flow_name: &str,
        step_name: &str,
        position: AwaitPosition,
        config: &AwaitConfig,
    ) -> Result<(), AwaitError> {
        match config.kind {
            AwaitKind::Time => {
                let delay = config.delay.unwrap_or_default();
                let job_id = await_job_id(run_id, step_name, position.as_str(), "resolve");
                let job = ScheduledJob::one_time(
                    job_id,
                    now_ms() + delay.as_millis() as i64,
                    JobKind::AwaitResolve {
                        run_id: run_id.to_string(),
                        flow_name: flow_name.to_string(),
                        step_name: step_name.to_string(),
                        position,
                        await_type: AwaitResolveType::Time,
                    },
                );
                self.scheduler.schedule(job).await?;
            }
            AwaitKind::Schedule => {
                let cron_expr = config.cron.clone().unwrap_or_default();
                let tz = config
                    .timezone
                    .as_deref()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(chrono_tz::UTC);
                let next_run = next_cron_occurrence(&cron_expr, tz).map_err(|e| AwaitError::InvalidCron(e.to_string()))?;
                let job_id = await_job_id(run_id, step_name, position.as_str(), "resolve");
                let job = ScheduledJob::one_time(
                    job_id,
                    next_run,
                    JobKind::AwaitResolve {
                        run_id: run_id.to_string(),
                        flow_name: flow_name.to_string(),
                        step_name: step_name.to_string(),
                        position,
                        await_type: AwaitResolveType::Schedule,
                    },
                );
                self.scheduler.schedule(job).await?;
            }
            AwaitKind::Webhook => {
                self.schedule_timeout_guard(run_id, flow_name, step_name, position, config).await?;
            }
            AwaitKind::Event => {
                let timeout_job_id = self.schedule_timeout_guard(run_id, flow_name, step_name, position, config).await?;
                if let Some(pattern) = &config.event_pattern {
                    self.event_waiters.entry(run_id.to_string()).or_default().push(PendingEventAwait {
                        run_id: run_id.to_string(),
                        flow_name: flow_name.to_string(),
                        step_name: step_name.to_string(),
                        position,
                        pattern: pattern.clone(),
                        timeout_job_id,
                    });
                }
            }
        }
        Ok(())
    }

    async fn schedule_timeout_guard(
        &self,
        run_id: &str,
        flow_name: &str,
        step_name: &str,
        position: AwaitPosition,
        config: &AwaitConfig,
    ) -> Result<String, AwaitError> {
        let job_id = await_job_id(run_id, step_name, position.as_str(), "timeout");
        let job = ScheduledJob::one_time(
            job_id.clone(),
            now_ms() + config.effective_timeout().as_millis() as i64,
            JobKind::AwaitTimeoutGuard {
                run_id: run_id.to_string(),
                flow_name: flow_name.to_string(),
                step_name: step_name.to_string(),
                position,
                timeout_action: match config.timeout_action {
                    TimeoutAction::Fail => "fail",
                    TimeoutAction::Continue => "continue",
                    TimeoutAction::Retry => "retry",
                }
                .to_string(),
            },
        );
        self.scheduler.schedule(job).await?;
        Ok(job_id)
    }

    /// External webhook callback resolving a `webhook`-kind await
    /// (spec.md §4.5 table: "external HTTP callback publishes
    /// `await.resolved`... on resolution the timeout job is unscheduled").
    pub async fn resolve_webhook(&self, run_id: &str, flow_name: &str, step_name: &str, position: AwaitPosition, body: Value) {
        let timeout_job_id = await_job_id(run_id, step_name, position.as_str(), "timeout");
        let _ = self.scheduler.unschedule(&timeout_job_id).await;
        self.publish_resolved(run_id, flow_name, step_name, position, body).await;
    }

    async fn on_emit(&self, event: Event) -> Result<(), anyhow::Error> {
        if event.is_persisted() {
            return Ok(());
        }
        let Some(name) = event.data.get("name").and_then(|v| v.as_str()) else {
            return Ok(());
        };

        let Some(mut waiters) = self.event_waiters.get_mut(&event.run_id) else {
            return Ok(());
        };
        let Some(pos) = waiters.iter().position(|w| w.pattern == name) else {
            return Ok(());
        };
        let waiter = waiters.remove(pos);
        drop(waiters);

        let _ = self.scheduler.unschedule(&waiter.timeout_job_id).await;
        self.publish_resolved(
            &waiter.run_id,
            &waiter.flow_name,
            &waiter.step_name,
            waiter.position,
            event.data.get("payload").cloned().unwrap_or(Value::Null),
        )
        .await;
        Ok(())
    }

    async fn publish_resolved(&self, run_id: &str, flow_name: &str, step_name: &str, position: AwaitPosition, trigger_data: Value) {
        let event = Event::ingress(
            EventType::AwaitResolved,
            run_id.to_string(),
            flow_name.to_string(),
            serde_json::json!({"position": position.as_str(), "triggerData": trigger_data}),
        )
        .with_step(step_name.to_string());
        self.bus.publish(event).await;
    }
}
