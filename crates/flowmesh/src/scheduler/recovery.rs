//! Startup recovery (spec.md §4.4.4): reconstruct in-memory timers for every
//! persisted job whose handler can be rebuilt from its metadata.

use std::str::FromStr;
use std::sync::Arc;

use chrono_tz::Tz;

use super::{next_cron_occurrence, Scheduler, SchedulerError};
use crate::model::{now_ms, JobKind, JobMetadata, JobSchedule, ScheduledJob};

pub async fn recover(scheduler: &Arc<Scheduler>) -> Result<(), SchedulerError> {
    let entries = scheduler.get_all_persisted_jobs().await?;
    tracing::info!(count = entries.len(), "scheduler recovery: scanning persisted jobs");

    for entry in entries {
        if scheduler.is_scheduled(&entry.id) {
            continue;
        }
        let Some(job) = decode_job(&entry.id, &entry.metadata) else {
            tracing::debug!(job.id = %entry.id, "skipping job with unrecognized or disabled metadata during recovery");
            continue;
        };
        recover_job(scheduler, job).await;
    }
    Ok(())
}

fn decode_job(id: &str, metadata: &serde_json::Value) -> Option<ScheduledJob> {
    let enabled = metadata.get("enabled").and_then(|v| v.as_bool()).unwrap_or(true);
    if !enabled {
        return None;
    }
    let kind_meta: JobMetadata = serde_json::from_value(metadata.get("kind")?.clone()).ok()?;
    let kind = JobKind::rebuild(&kind_meta)?;

    let schedule: JobSchedule = serde_json::from_value(metadata.get("schedule")?.clone()).ok()?;
    let cron = metadata.get("cron").and_then(|v| v.as_str()).map(String::from);
    let timezone = metadata
        .get("timezone")
        .and_then(|v| v.as_str())
        .and_then(|s| Tz::from_str(s).ok());
    let interval_ms = metadata.get("intervalMs").and_then(|v| v.as_u64());
    let execute_at = metadata.get("executeAt").and_then(|v| v.as_i64());

    let next_run = match schedule {
        JobSchedule::OneTime => execute_at,
        JobSchedule::Interval => Some(now_ms() + interval_ms.unwrap_or(60_000) as i64),
        JobSchedule::Cron => cron
            .as_deref()
            .and_then(|expr| next_cron_occurrence(expr, timezone.unwrap_or(chrono_tz::UTC)).ok()),
    };

    Some(ScheduledJob {
        id: id.to_string(),
        schedule,
        cron,
        timezone,
        interval_ms,
        execute_at,
        enabled: true,
        kind,
        last_run: None,
        next_run,
        run_count: 0,
        fail_count: 0,
        last_error: None,
    })
}

/// Recreate the in-memory timer for a recovered job (spec.md §4.4.4 step 3).
/// An overdue one-shot await-pattern job fires immediately, without the
/// lock, on the theory that "the flow has already waited long enough";
/// any other overdue one-shot is simply skipped rather than fired late.
async fn recover_job(scheduler: &Arc<Scheduler>, mut job: ScheduledJob) {
    let overdue = matches!(job.schedule, JobSchedule::OneTime) && job.next_run.is_some_and(|t| t < now_ms());

    if overdue {
        if job.kind.fire_immediately_if_overdue() {
            if let Some(event) = job.kind.build_event() {
                scheduler.bus.publish(event).await;
            }
        }
        return;
    }

    if job.next_run.is_none() {
        job.next_run = Some(now_ms());
    }
    scheduler.adopt(job);
}
