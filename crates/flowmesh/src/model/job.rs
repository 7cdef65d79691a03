//! Scheduled job model (spec.md §3.1 "Scheduled job", §9 "Handler
//! reconstruction for persisted jobs").
//!
//! The scheduler cannot serialize a function pointer, so a persisted job
//! carries only [`JobMetadata`] plus a [`JobKind`] discriminant; after a
//! restart, [`JobKind::rebuild`] reconstructs the handler from that
//! metadata alone. A job whose metadata doesn't match any known kind is
//! refused rather than silently dropped (spec.md §9).

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::event::{now_ms, Event, EventType};
use crate::model::run::AwaitPosition;

/// How a job recurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSchedule {
    Cron,
    Interval,
    OneTime,
}

/// Flattened metadata written alongside a job record (spec.md §4.4.3): "job
/// record *minus handler*". [`JobKind::rebuild`] is the inverse of
/// [`JobKind::to_metadata`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    /// `"schedule-trigger"` for trigger cron/interval jobs.
    pub job_type: Option<String>,
    /// `"await-pattern"` for await registration/timeout jobs.
    pub component: Option<String>,
    pub await_type: Option<String>,
    pub run_id: Option<String>,
    pub flow_name: Option<String>,
    pub step_name: Option<String>,
    pub position: Option<String>,
    pub timeout_action: Option<String>,
    pub trigger_name: Option<String>,
    pub cron: Option<String>,
    pub timezone: Option<String>,
}

/// The rebuildable sum type of job handlers (spec.md §9). Every variant
/// knows how to turn itself into the [`Event`] it must publish when its
/// scheduled time arrives, and how to round-trip through [`JobMetadata`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    /// Per-flow outer deadline (§4.6.1). On fire, the stall detector reads
    /// the run's current status directly rather than publishing an event
    /// (see `crate::stall`); this variant exists so the scheduler can
    /// dispatch to it uniformly.
    StallTimeout { run_id: String, flow_name: String },

    /// `time` or `schedule` await: resolves on the scheduler's own clock,
    /// with no external signal required (§4.5 table).
    AwaitResolve {
        run_id: String,
        flow_name: String,
        step_name: String,
        position: AwaitPosition,
        await_type: AwaitResolveType,
    },

    /// `webhook` or `event` await: this job is purely a timeout backstop;
    /// the actual resolution comes from an external call or a matching bus
    /// event, handled outside the scheduler.
    AwaitTimeoutGuard {
        run_id: String,
        flow_name: String,
        step_name: String,
        position: AwaitPosition,
        timeout_action: String,
    },

    /// Recurring trigger fire (cron or interval schedule trigger, §4.3).
    TriggerFire { trigger_name: String },
}

/// Distinguishes the two await kinds that resolve on the scheduler's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitResolveType {
    Time,
    Schedule,
}

impl JobKind {
    pub fn to_metadata(&self) -> JobMetadata {
        match self {
            JobKind::StallTimeout { run_id, flow_name } => JobMetadata {
                job_type: Some("stall-timeout".to_string()),
                run_id: Some(run_id.clone()),
                flow_name: Some(flow_name.clone()),
                ..Default::default()
            },
            JobKind::AwaitResolve {
                run_id,
                flow_name,
                step_name,
                position,
                await_type,
            } => JobMetadata {
                component: Some("await-pattern".to_string()),
                await_type: Some(
                    match await_type {
                        AwaitResolveType::Time => "time",
                        AwaitResolveType::Schedule => "schedule",
                    }
                    .to_string(),
                ),
                run_id: Some(run_id.clone()),
                flow_name: Some(flow_name.clone()),
                step_name: Some(step_name.clone()),
                position: Some(position.as_str().to_string()),
                ..Default::default()
            },
            JobKind::AwaitTimeoutGuard {
                run_id,
                flow_name,
                step_name,
                position,
                timeout_action,
            } => JobMetadata {
                component: Some("await-pattern".to_string()),
                await_type: Some("webhook-or-event".to_string()),
                run_id: Some(run_id.clone()),
                flow_name: Some(flow_name.clone()),
                step_name: Some(step_name.clone()),
                position: Some(position.as_str().to_string()),
                timeout_action: Some(timeout_action.clone()),
                ..Default::default()
            },
            JobKind::TriggerFire { trigger_name } => JobMetadata {
                job_type: Some("schedule-trigger".to_string()),
                trigger_name: Some(trigger_name.clone()),
                ..Default::default()
            },
        }
    }

    /// Reconstruct a job's handler kind from its persisted metadata
    /// (spec.md §4.4.4 step 2). Returns `None` for metadata matching no
    /// known kind — the caller skips the job rather than guessing.
    pub fn rebuild(metadata: &JobMetadata) -> Option<JobKind> {
        if metadata.job_type.as_deref() == Some("stall-timeout") {
            return Some(JobKind::StallTimeout {
                run_id: metadata.run_id.clone()?,
                flow_name: metadata.flow_name.clone()?,
            });
        }
        if metadata.job_type.as_deref() == Some("schedule-trigger") {
            return Some(JobKind::TriggerFire {
                trigger_name: metadata.trigger_name.clone()?,
            });
        }
        if metadata.component.as_deref() == Some("await-pattern") {
            let run_id = metadata.run_id.clone()?;
            let flow_name = metadata.flow_name.clone()?;
            let step_name = metadata.step_name.clone()?;
            let position = AwaitPosition::parse(metadata.position.as_deref()?)?;
            return match metadata.await_type.as_deref()? {
                "time" => Some(JobKind::AwaitResolve {
                    run_id,
                    flow_name,
                    step_name,
                    position,
                    await_type: AwaitResolveType::Time,
                }),
                "schedule" => Some(JobKind::AwaitResolve {
                    run_id,
                    flow_name,
                    step_name,
                    position,
                    await_type: AwaitResolveType::Schedule,
                }),
                "webhook-or-event" => Some(JobKind::AwaitTimeoutGuard {
                    run_id,
                    flow_name,
                    step_name,
                    position,
                    timeout_action: metadata.timeout_action.clone().unwrap_or_else(|| "fail".to_string()),
                }),
                _ => None,
            };
        }
        None
    }

    /// Whether an overdue one-shot of this kind should fire immediately at
    /// startup recovery without acquiring the lock (spec.md §4.4.4 step 3):
    /// true for every await-pattern job ("the flow has already waited long
    /// enough"), false otherwise.
    pub fn fire_immediately_if_overdue(&self) -> bool {
        matches!(self, JobKind::AwaitResolve { .. } | JobKind::AwaitTimeoutGuard { .. })
    }

    /// Build the [`Event`] this job kind publishes when it fires. Returns
    /// `None` for [`JobKind::StallTimeout`], whose firing is handled
    /// directly by `crate::stall` rather than a bus event.
    pub fn build_event(&self) -> Option<Event> {
        match self {
            JobKind::StallTimeout { .. } => None,
            JobKind::AwaitResolve {
                run_id,
                flow_name,
                step_name,
                position,
                await_type,
            } => {
                let trigger_data = match await_type {
                    AwaitResolveType::Time => serde_json::json!({"delayCompleted": true}),
                    AwaitResolveType::Schedule => serde_json::json!({"scheduledAt": now_ms()}),
                };
                Some(
                    Event::ingress(
                        EventType::AwaitResolved,
                        run_id.clone(),
                        flow_name.clone(),
                        serde_json::json!({
                            "position": position.as_str(),
                            "triggerData": trigger_data,
                        }),
                    )
                    .with_step(step_name.clone()),
                )
            }
            JobKind::AwaitTimeoutGuard {
                run_id,
                flow_name,
                step_name,
                position,
                timeout_action,
            } => Some(
                Event::ingress(
                    EventType::AwaitTimeout,
                    run_id.clone(),
                    flow_name.clone(),
                    serde_json::json!({
                        "position": position.as_str(),
                        "timeoutAction": timeout_action,
                    }),
                )
                .with_step(step_name.clone()),
            ),
            JobKind::TriggerFire { trigger_name } => Some(Event::ingress(
                EventType::TriggerFired,
                String::new(),
                String::new(),
                serde_json::json!({"triggerName": trigger_name, "scheduledAt": now_ms()}),
            )),
        }
    }
}

/// A durable scheduled job as the scheduler persists it (spec.md §3.1).
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: String,
    pub schedule: JobSchedule,
    pub cron: Option<String>,
    pub timezone: Option<Tz>,
    pub interval_ms: Option<u64>,
    pub execute_at: Option<i64>,
    pub enabled: bool,
    pub kind: JobKind,
    pub last_run: Option<i64>,
    pub next_run: Option<i64>,
    pub run_count: u64,
    pub fail_count: u64,
    pub last_error: Option<String>,
}

impl ScheduledJob {
    pub fn one_time(id: impl Into<String>, execute_at: i64, kind: JobKind) -> Self {
        Self {
            id: id.into(),
            schedule: JobSchedule::OneTime,
            cron: None,
            timezone: None,
            interval_ms: None,
            execute_at: Some(execute_at),
            enabled: true,
            kind,
            last_run: None,
            next_run: Some(execute_at),
            run_count: 0,
            fail_count: 0,
            last_error: None,
        }
    }

    pub fn cron(id: impl Into<String>, cron: impl Into<String>, timezone: Tz, kind: JobKind) -> Self {
        Self {
            id: id.into(),
            schedule: JobSchedule::Cron,
            cron: Some(cron.into()),
            timezone: Some(timezone),
            interval_ms: None,
            execute_at: None,
            enabled: true,
            kind,
            last_run: None,
            next_run: None,
            run_count: 0,
            fail_count: 0,
            last_error: None,
        }
    }

    pub fn interval(id: impl Into<String>, interval_ms: u64, kind: JobKind) -> Self {
        Self {
            id: id.into(),
            schedule: JobSchedule::Interval,
            cron: None,
            timezone: None,
            interval_ms: Some(interval_ms),
            execute_at: None,
            enabled: true,
            kind,
            last_run: None,
            next_run: Some(now_ms() + interval_ms as i64),
            run_count: 0,
            fail_count: 0,
            last_error: None,
        }
    }

    /// Job metadata value blob persisted by the scheduler (§4.4.3), plus
    /// scheduling parameters needed to recreate the in-memory timer.
    pub fn metadata_value(&self) -> Value {
        serde_json::json!({
            "kind": self.kind.to_metadata(),
            "schedule": self.schedule,
            "cron": self.cron,
            "timezone": self.timezone.map(|tz| tz.to_string()),
            "intervalMs": self.interval_ms,
            "executeAt": self.execute_at,
            "enabled": self.enabled,
        })
    }
}
