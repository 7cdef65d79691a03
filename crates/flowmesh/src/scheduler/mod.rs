//! Durable scheduler: one-shot, cron and interval jobs with distributed
//! locking and startup recovery (spec.md §4.4).

pub mod lock;
pub mod recovery;

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::adapters::{IndexStore, KvStore, ReadDirection, StoreError};
use crate::bus::EventBus;
use crate::model::{now_ms, JobKind, JobSchedule, ScheduledJob};

pub use lock::{DistributedLock, StoreCapabilities};

/// Callback the stall detector registers on the scheduler so a firing
/// [`JobKind::StallTimeout`] reaches it directly instead of through a bus
/// event (spec.md §4.6.1; `JobKind::build_event` returns `None` for this
/// variant precisely because this is the intended dispatch path).
#[async_trait]
pub trait StallFireHandler: Send + Sync {
    async fn on_stall_fire(&self, run_id: String, flow_name: String);
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("job {0:?} not found")]
    JobNotFound(String),
    #[error("invalid cron expression {0:?}: {1}")]
    InvalidCron(String, String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Tunable knobs named throughout spec.md §4.4 (`RuntimeConfig` wires
/// these; see SPEC_FULL.md §3.4).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub lock_ttl: Duration,
    pub lock_renew_fraction: f64,
    pub instance_id: String,
    pub recovery_scan_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(5 * 60),
            lock_renew_fraction: 0.5,
            instance_id: format!("instance-{}", uuid::Uuid::now_v7()),
            recovery_scan_limit: 10_000,
        }
    }
}

const JOBS_INDEX_KEY: &str = "scheduler:jobs";
const LOCKS_INDEX_KEY: &str = "scheduler:locks";

struct JobEntry {
    job: ScheduledJob,
    timer: Option<JoinHandle<()>>,
}

/// Durable job scheduler. Holds the in-memory set of active timers plus the
/// persisted job/lock state in the Store.
///
/// Always used behind `Arc<Scheduler>` — the timer loop for each job is a
/// spawned task holding its own `Arc` clone, per the teacher's "one
/// cooperative task, fed by a channel/timer, no held lock across await"
/// idiom (durable's worker pool follows the same shape).
pub struct Scheduler {
    bus: EventBus,
    index: Arc<dyn IndexStore>,
    kv: Arc<dyn KvStore>,
    config: SchedulerConfig,
    lock: Arc<DistributedLock>,
    jobs: DashMap<String, JobEntry>,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    stall_handler: RwLock<Option<Arc<dyn StallFireHandler>>>,
}

impl Scheduler {
    /// Construct a scheduler using index-mode locking (preferred whenever
    /// the Store supports sorted-index add, spec.md §4.4.2).
    pub fn new(bus: EventBus, index: Arc<dyn IndexStore>, kv: Arc<dyn KvStore>, config: SchedulerConfig) -> Arc<Self> {
        let lock = Arc::new(DistributedLock::index_mode(
            index.clone(),
            LOCKS_INDEX_KEY,
            config.lock_ttl,
            config.instance_id.clone(),
        ));
        Self::with_lock(bus, index, kv, config, lock)
    }

    /// Construct a scheduler over a KV-only Store, using the racy fallback
    /// lock mode (spec.md §4.4.2).
    pub fn new_kv_mode(
        bus: EventBus,
        index: Arc<dyn IndexStore>,
        kv: Arc<dyn KvStore>,
        config: SchedulerConfig,
        capabilities: StoreCapabilities,
    ) -> Arc<Self> {
        let lock = Arc::new(DistributedLock::kv_mode(
            kv.clone(),
            LOCKS_INDEX_KEY,
            config.lock_ttl,
            config.instance_id.clone(),
            capabilities,
        ));
        Self::with_lock(bus, index, kv, config, lock)
    }

    fn with_lock(bus: EventBus, index: Arc<dyn IndexStore>, kv: Arc<dyn KvStore>, config: SchedulerConfig, lock: Arc<DistributedLock>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            bus,
            index,
            kv,
            config,
            lock,
            jobs: DashMap::new(),
            started: AtomicBool::new(false),
            shutdown_tx,
            stall_handler: RwLock::new(None),
        })
    }

    /// Register the stall detector as the target for firing
    /// [`JobKind::StallTimeout`] jobs. Must be called before `start()` if
    /// the caller wants recovered stall jobs to reach it too, though a
    /// handler registered later still catches every subsequent firing.
    pub fn set_stall_handler(&self, handler: Arc<dyn StallFireHandler>) {
        *self.stall_handler.write() = Some(handler);
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Persist `job` and start its in-memory timer (spec.md §4.4.3).
    #[tracing::instrument(skip(self, job), fields(job.id = %job.id))]
    pub async fn schedule(self: &Arc<Self>, job: ScheduledJob) -> Result<String, SchedulerError> {
        let id = job.id.clone();
        self.persist_job(&job).await?;
        self.start_timer(job);
        Ok(id)
    }

    async fn persist_job(&self, job: &ScheduledJob) -> Result<(), SchedulerError> {
        let metadata = job.metadata_value();
        let score = job.next_run.unwrap_or_else(now_ms) as f64;
        if !self.index.add(JOBS_INDEX_KEY, &job.id, score, metadata.clone()).await? {
            self.index.update_with_retry(JOBS_INDEX_KEY, &job.id, metadata, 3).await?;
        }
        Ok(())
    }

    fn start_timer(self: &Arc<Self>, job: ScheduledJob) {
        if !job.enabled {
            self.jobs.insert(job.id.clone(), JobEntry { job, timer: None });
            return;
        }
        let id = job.id.clone();
        let scheduler = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let Some(next_run) = scheduler.next_run_for(&id) else { break };
                let delay_ms = (next_run - now_ms()).max(0) as u64;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    _ = shutdown_rx.changed() => break,
                }
                if *shutdown_rx.borrow() {
                    break;
                }
                if !scheduler.fire(&id).await {
                    break;
                }
            }
        });
        self.jobs.insert(job.id.clone(), JobEntry { job, timer: Some(handle) });
    }

    fn next_run_for(&self, id: &str) -> Option<i64> {
        self.jobs.get(id).and_then(|e| e.job.next_run)
    }

    /// One firing of `executeWithLock` (spec.md §4.4.1). Returns `false`
    /// when the job's timer loop should stop (one-time job consumed, or
    /// the job was unscheduled out from under us).
    async fn fire(self: &Arc<Self>, id: &str) -> bool {
        if !self.jobs.contains_key(id) {
            return false;
        }

        let acquired = self.lock.try_acquire(id).await.unwrap_or(false);
        if !acquired {
            // Another instance holds the lock; this instance stands down
            // for this firing. Recurring jobs get a fresh next_run below
            // regardless, so the timer loop keeps participating in future
            // firings (invariant 7: at most one *executor*, not scheduler).
            return self.reschedule_after_fire(id, false).await;
        }

        let renew_handle = self.spawn_lock_renewal(id.to_string());
        let outcome = self.execute_job(id).await;
        renew_handle.abort();
        let _ = self.lock.release(id).await;

        outcome
    }

    fn spawn_lock_renewal(self: &Arc<Self>, id: String) -> JoinHandle<()> {
        let scheduler = self.clone();
        let interval = scheduler.config.lock_ttl.mul_f64(scheduler.config.lock_renew_fraction.clamp(0.05, 0.95));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if scheduler.lock.renew(&id).await.unwrap_or(false) {
                    continue;
                }
                break;
            }
        })
    }

    /// `executeJob` (spec.md §4.4.1 step 3): invoke the handler, update run
    /// bookkeeping, and decide whether the timer loop continues.
    async fn execute_job(self: &Arc<Self>, id: &str) -> bool {
        let Some(kind) = self.jobs.get(id).map(|e| e.job.kind.clone()) else {
            return self.reschedule_after_fire(id, true).await;
        };
        if let JobKind::StallTimeout { run_id, flow_name } = &kind {
            let handler = self.stall_handler.read().clone();
            if let Some(handler) = handler {
                handler.on_stall_fire(run_id.clone(), flow_name.clone()).await;
            }
            return self.reschedule_after_fire(id, true).await;
        }
        let Some(event) = kind.build_event() else {
            return self.reschedule_after_fire(id, true).await;
        };
        self.bus.publish(event).await;
        self.reschedule_after_fire(id, true).await
    }

    /// Decide the next `next_run` for a job that just fired, or that a
    /// one-time job is done and must be forgotten entirely — both the
    /// in-memory entry and its persisted record (mirroring [`Self::unschedule`]).
    /// Leaving a consumed one-time job behind would make `is_scheduled`
    /// keep reporting it as live, and a restart would re-read its stale
    /// persisted record and re-fire it (spec.md §3.2.4: at most one
    /// `resolved`/`timeout`, never both).
    async fn reschedule_after_fire(self: &Arc<Self>, id: &str, ran: bool) -> bool {
        enum Next {
            Continue,
            StopKeep,
            StopRemove,
        }

        let next = {
            let Some(mut entry) = self.jobs.get_mut(id) else {
                return false;
            };
            let now = now_ms();
            if ran {
                entry.job.run_count += 1;
                entry.job.last_run = Some(now);
            }
            match entry.job.schedule {
                JobSchedule::OneTime => Next::StopRemove,
                JobSchedule::Interval => {
                    let interval_ms = entry.job.interval_ms.unwrap_or(60_000) as i64;
                    entry.job.next_run = Some(now + interval_ms);
                    Next::Continue
                }
                JobSchedule::Cron => match entry.job.cron.clone() {
                    None => Next::StopKeep,
                    Some(cron_expr) => {
                        let tz = entry.job.timezone.unwrap_or(chrono_tz::UTC);
                        match next_cron_occurrence(&cron_expr, tz) {
                            Ok(next) => {
                                entry.job.next_run = Some(next);
                                Next::Continue
                            }
                            Err(err) => {
                                entry.job.fail_count += 1;
                                entry.job.last_error = Some(err.to_string());
                                Next::StopKeep
                            }
                        }
                    }
                },
            }
        };

        match next {
            Next::Continue => true,
            Next::StopKeep => false,
            Next::StopRemove => {
                // Dropping the `JoinHandle` (rather than `.abort()`-ing it, as
                // `unschedule` does) just detaches it — correct here since
                // we're running inside that very timer loop, which is about
                // to return `false` and exit on its own.
                self.jobs.remove(id);
                let _ = self.index.delete(JOBS_INDEX_KEY, id).await;
                false
            }
        }
    }

    /// Remove a job: stop its timer and delete its persisted record +
    /// any lock it holds.
    #[tracing::instrument(skip(self))]
    pub async fn unschedule(&self, id: &str) -> Result<bool, SchedulerError> {
        let Some((_, entry)) = self.jobs.remove(id) else {
            return Ok(false);
        };
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        self.index.delete(JOBS_INDEX_KEY, id).await?;
        self.lock.release(id).await?;
        Ok(true)
    }

    /// Jobs whose id contains `pattern` — used to find all jobs belonging
    /// to a run (`flow.cancel`, §4.2.8) since `runId` is embedded in job
    /// ids by convention.
    pub fn get_jobs_by_pattern(&self, pattern: &str) -> Vec<String> {
        self.jobs.iter().filter(|e| e.key().contains(pattern)).map(|e| e.key().clone()).collect()
    }

    pub fn get_scheduled_jobs(&self) -> Vec<String> {
        self.jobs.iter().map(|e| e.key().clone()).collect()
    }

    /// Read up to `recovery_scan_limit` persisted jobs straight from the
    /// Store, independent of what's currently loaded in memory.
    pub async fn get_all_persisted_jobs(&self) -> Result<Vec<crate::adapters::IndexEntry>, SchedulerError> {
        Ok(self.index.read(JOBS_INDEX_KEY, ReadDirection::Ascending, 0, self.config.recovery_scan_limit).await?)
    }

    pub fn is_healthy(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    /// Start accepting work: run startup recovery (spec.md §4.4.4), then
    /// flip to accepting state.
    pub async fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        recovery::recover(self).await?;
        self.started.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Stop: cancel every in-memory timer and release every lock owned by
    /// this instance (spec.md §4.4.5).
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        self.started.store(false, Ordering::Relaxed);
        let _ = self.shutdown_tx.send(true);
        let ids: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, mut entry)) = self.jobs.remove(&id) {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
            }
        }
        self.lock.release_all_owned().await?;
        Ok(())
    }

    /// Adopt a job reconstructed during recovery: starts its timer without
    /// re-persisting (the record is already in the Store).
    pub(crate) fn adopt(self: &Arc<Self>, job: ScheduledJob) {
        self.start_timer(job);
    }

    pub(crate) fn is_scheduled(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }
}

/// Compute the next UTC occurrence of `cron_expr` evaluated in `timezone`.
pub fn next_cron_occurrence(cron_expr: &str, timezone: Tz) -> Result<i64, SchedulerError> {
    let schedule = CronSchedule::from_str(cron_expr).map_err(|e| SchedulerError::InvalidCron(cron_expr.to_string(), e.to_string()))?;
    let now_local = Utc::now().with_timezone(&timezone);
    let next = schedule
        .after(&now_local)
        .next()
        .ok_or_else(|| SchedulerError::InvalidCron(cron_expr.to_string(), "no upcoming occurrence".to_string()))?;
    Ok(next.with_timezone(&Utc).timestamp_millis())
}

/// Build a deterministic job id for an await-pattern job, used so
/// `flow.cancel`'s `getJobsByPattern(runId)` finds it (spec.md §4.2.8).
pub fn await_job_id(run_id: &str, step_name: &str, position: &str, suffix: &str) -> String {
    format!("await:{run_id}:{step_name}:{position}:{suffix}")
}

pub fn stall_job_id(run_id: &str) -> String {
    format!("stall-timeout:{run_id}")
}

pub fn trigger_job_id(trigger_name: &str) -> String {
    format!("trigger:{trigger_name}")
}
