//! Queue adapter contract (spec.md §6.1)
//!
//! The orchestrator never executes a step itself — it hands work to the
//! Queue adapter and reacts to `step.completed` / `step.failed` events
//! published back onto the [`crate::bus::EventBus`] by the worker side.
//! Idempotency by deterministic `jobId` is a hard contract: `enqueue` with
//! an already-known jobId must return the existing job id without creating
//! a duplicate, never a best-effort optimization.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle states a queued job can be observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
}

/// Per-job scheduling knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    /// Deterministic id for idempotent enqueue. `None` lets the adapter
    /// generate one (used only for jobs that never need de-duplication).
    pub job_id: Option<String>,
    /// Maximum attempts the adapter will make before giving up.
    pub attempts: Option<u32>,
    /// Backoff between attempts, in milliseconds.
    pub backoff_ms: Option<u64>,
    /// Delay before the job becomes eligible to run.
    pub delay: Option<Duration>,
    /// Higher priority jobs are claimed first.
    pub priority: Option<i32>,
    /// Wall-clock budget for a single execution attempt, propagated from
    /// the step's `stepTimeout` (spec.md §5 "Timeouts").
    pub timeout: Option<Duration>,
}

/// Options accepted by [`Queue::schedule`] for recurring/delayed enqueue.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub delay: Option<Duration>,
    pub cron: Option<String>,
    pub repeat_every: Option<Duration>,
}

/// A job as the queue adapter sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub data: Value,
    pub state: JobState,
    pub attempts_made: u32,
}

/// Aggregate counts per queue, used by observability callers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: u64,
}

/// Errors surfaced by a Queue adapter.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue {0:?} not found")]
    QueueNotFound(String),
    #[error("job {0:?} not found")]
    JobNotFound(String),
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Queue adapter contract (spec.md §6.1).
///
/// Implementations MUST guarantee at-most-one active job per `jobId`:
/// `enqueue` called again with a `jobId` that already has a
/// waiting/active/delayed job returns that job's id without re-creating it.
#[async_trait]
pub trait Queue: Send + Sync + 'static {
    /// Enqueue a job for immediate (or `opts.delay`-deferred) execution.
    ///
    /// Returns the effective job id — either the caller-supplied `jobId`
    /// from `opts`, or one the adapter generated.
    async fn enqueue(
        &self,
        queue_name: &str,
        job_name: &str,
        data: Value,
        opts: JobOptions,
    ) -> Result<String, QueueError>;

    /// Schedule a job on a delay, cron, or repeat interval. Distinct from
    /// `enqueue`'s one-shot `delay` option in that it is meant for queue-side
    /// recurring work (the crate's own [`crate::scheduler`] is the
    /// authoritative durable-timer component; this exists for Queue
    /// backends that also offer native repeat support).
    async fn schedule(
        &self,
        queue_name: &str,
        job_name: &str,
        data: Value,
        opts: EnqueueOptions,
    ) -> Result<String, QueueError>;

    async fn get_job(&self, queue_name: &str, job_id: &str) -> Result<Option<JobRecord>, QueueError>;

    async fn get_jobs(&self, queue_name: &str, state: JobState) -> Result<Vec<JobRecord>, QueueError>;

    async fn get_job_counts(&self, queue_name: &str) -> Result<JobCounts, QueueError>;

    async fn is_paused(&self, queue_name: &str) -> Result<bool, QueueError>;

    async fn pause(&self, queue_name: &str) -> Result<(), QueueError>;

    async fn resume(&self, queue_name: &str) -> Result<(), QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_options_default_has_no_job_id() {
        let opts = JobOptions::default();
        assert!(opts.job_id.is_none());
        assert!(opts.timeout.is_none());
    }
}
