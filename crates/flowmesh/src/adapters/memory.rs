//! In-memory reference implementations of Queue, Store, and Stream.
//!
//! Grounded on the teacher's `InMemoryWorkflowEventStore`: "primarily for
//! testing... provides the same semantics as the [durable] implementation."
//! These are not meant for production use — no persistence survives process
//! restart, and `IndexStore::update` contention is `parking_lot`-guarded
//! rather than truly lock-free — but the *semantics* (optimistic version
//! conflicts, monotonic stream ids, idempotent job ids) match what a real
//! backend must provide.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::queue::{EnqueueOptions, JobCounts, JobOptions, JobRecord, JobState, Queue, QueueError};
use super::store::{IndexEntry, IndexStore, KvStore, ReadDirection, StoreError, StreamEvent, StreamFilter, StreamStore};
use super::stream::{Stream, StreamError, SubscriptionId};
use crate::value::merge_deep;

/// Combined Store implementation (stream + kv + index) over one process's
/// memory. `Arc<InMemoryStore>` is `Clone`-free by design — share it via
/// `Arc`, same as the teacher shares `Arc<dyn WorkflowEventStore>`.
#[derive(Default)]
pub struct InMemoryStore {
    streams: RwLock<HashMap<String, Vec<StreamEvent>>>,
    stream_seq: RwLock<HashMap<String, i64>>,
    kv: RwLock<HashMap<String, (Value, Option<std::time::Instant>)>>,
    indices: RwLock<HashMap<String, HashMap<String, IndexEntry>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreamStore for InMemoryStore {
    async fn append(&self, subject: &str, event_type: &str, payload: Value) -> Result<StreamEvent, StoreError> {
        let mut seqs = self.stream_seq.write();
        let id = seqs.entry(subject.to_string()).or_insert(0);
        *id += 1;
        let event = StreamEvent {
            id: *id,
            ts: super::store::now_ms(),
            event_type: event_type.to_string(),
            payload,
        };
        self.streams
            .write()
            .entry(subject.to_string())
            .or_default()
            .push(event.clone());
        Ok(event)
    }

    async fn read(&self, subject: &str, filter: StreamFilter) -> Result<Vec<StreamEvent>, StoreError> {
        let streams = self.streams.read();
        let Some(events) = streams.get(subject) else {
            return Ok(vec![]);
        };
        let mut out: Vec<StreamEvent> = events
            .iter()
            .filter(|e| filter.types.as_ref().is_none_or(|t| t.contains(&e.event_type)))
            .filter(|e| filter.after.is_none_or(|after| e.id > after))
            .filter(|e| filter.before.is_none_or(|before| e.id < before))
            .filter(|e| filter.from_ts.is_none_or(|from| e.ts >= from))
            .filter(|e| filter.to_ts.is_none_or(|to| e.ts <= to))
            .cloned()
            .collect();
        if filter.descending {
            out.reverse();
        }
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn delete(&self, subject: &str) -> Result<(), StoreError> {
        self.streams.write().remove(subject);
        self.stream_seq.write().remove(subject);
        Ok(())
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let kv = self.kv.read();
        match kv.get(key) {
            Some((_, Some(expires))) if *expires < std::time::Instant::now() => Ok(None),
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires = ttl.map(|d| std::time::Instant::now() + d);
        self.kv.write().insert(key.to_string(), (value, expires));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.kv.write().remove(key);
        Ok(())
    }

    async fn clear(&self, pattern: &str) -> Result<u64, StoreError> {
        let prefix = pattern.trim_end_matches('*');
        let mut kv = self.kv.write();
        let matching: Vec<String> = kv
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &matching {
            kv.remove(key);
        }
        Ok(matching.len() as u64)
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        let mut kv = self.kv.write();
        let entry = kv.entry(key.to_string()).or_insert((Value::from(0i64), None));
        let current = entry.0.as_i64().unwrap_or(0);
        let next = current + by;
        entry.0 = Value::from(next);
        Ok(next)
    }
}

#[async_trait]
impl IndexStore for InMemoryStore {
    async fn add(&self, index_key: &str, id: &str, score: f64, metadata: Value) -> Result<bool, StoreError> {
        let mut indices = self.indices.write();
        let bucket = indices.entry(index_key.to_string()).or_default();
        if bucket.contains_key(id) {
            return Ok(false);
        }
        bucket.insert(
            id.to_string(),
            IndexEntry {
                id: id.to_string(),
                score,
                version: 0,
                metadata,
            },
        );
        Ok(true)
    }

    async fn get(&self, index_key: &str, id: &str) -> Result<Option<IndexEntry>, StoreError> {
        Ok(self
            .indices
            .read()
            .get(index_key)
            .and_then(|b| b.get(id))
            .cloned())
    }

    async fn read(
        &self,
        index_key: &str,
        direction: ReadDirection,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<IndexEntry>, StoreError> {
        let indices = self.indices.read();
        let Some(bucket) = indices.get(index_key) else {
            return Ok(vec![]);
        };
        let mut entries: Vec<IndexEntry> = bucket.values().cloned().collect();
        entries.sort_by(|a, b| a.score.total_cmp(&b.score));
        if direction == ReadDirection::Descending {
            entries.reverse();
        }
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }

    async fn update(
        &self,
        index_key: &str,
        id: &str,
        expected_version: u64,
        metadata: Value,
    ) -> Result<bool, StoreError> {
        let mut indices = self.indices.write();
        let Some(bucket) = indices.get_mut(index_key) else {
            return Ok(false);
        };
        let Some(entry) = bucket.get_mut(id) else {
            return Ok(false);
        };
        if entry.version != expected_version {
            return Ok(false);
        }
        merge_deep(&mut entry.metadata, &metadata);
        entry.version += 1;
        Ok(true)
    }

    async fn increment(&self, index_key: &str, id: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        let mut indices = self.indices.write();
        let bucket = indices.entry(index_key.to_string()).or_default();
        let entry = bucket.entry(id.to_string()).or_insert_with(|| IndexEntry {
            id: id.to_string(),
            score: 0.0,
            version: 0,
            metadata: Value::Object(Default::default()),
        });
        let current = crate::value::get_path(&entry.metadata, field)
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let next = current + by;
        crate::value::set_path(&mut entry.metadata, field, Value::from(next))
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        entry.version += 1;
        Ok(next)
    }

    async fn delete(&self, index_key: &str, id: &str) -> Result<(), StoreError> {
        if let Some(bucket) = self.indices.write().get_mut(index_key) {
            bucket.remove(id);
        }
        Ok(())
    }
}

/// In-memory job record, including idempotency bookkeeping.
struct QueuedJob {
    record: JobRecord,
    ready_at: std::time::Instant,
}

/// In-memory Queue. Idempotent by `(queue_name, job_id)`: re-enqueueing an
/// id already present in a non-terminal state is a no-op that returns the
/// existing job id, matching the hard contract in [`Queue`]'s docs.
#[derive(Default)]
pub struct InMemoryQueue {
    jobs: RwLock<HashMap<(String, String), QueuedJob>>,
    paused: RwLock<HashMap<String, bool>>,
    seq: AtomicU64,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&self) -> String {
        format!("job-{}", self.seq.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn enqueue(
        &self,
        queue_name: &str,
        job_name: &str,
        data: Value,
        opts: JobOptions,
    ) -> Result<String, QueueError> {
        let job_id = opts.job_id.clone().unwrap_or_else(|| self.fresh_id());
        let key = (queue_name.to_string(), job_id.clone());

        let mut jobs = self.jobs.write();
        if let Some(existing) = jobs.get(&key) {
            if !matches!(existing.record.state, JobState::Completed | JobState::Failed) {
                return Ok(job_id);
            }
        }

        jobs.insert(
            key,
            QueuedJob {
                record: JobRecord {
                    id: job_id.clone(),
                    queue: queue_name.to_string(),
                    name: job_name.to_string(),
                    data,
                    state: JobState::Waiting,
                    attempts_made: 0,
                },
                ready_at: std::time::Instant::now() + opts.delay.unwrap_or_default(),
            },
        );
        Ok(job_id)
    }

    async fn schedule(
        &self,
        queue_name: &str,
        job_name: &str,
        data: Value,
        opts: EnqueueOptions,
    ) -> Result<String, QueueError> {
        self.enqueue(
            queue_name,
            job_name,
            data,
            JobOptions {
                delay: opts.delay,
                ..Default::default()
            },
        )
        .await
    }

    async fn get_job(&self, queue_name: &str, job_id: &str) -> Result<Option<JobRecord>, QueueError> {
        Ok(self
            .jobs
            .read()
            .get(&(queue_name.to_string(), job_id.to_string()))
            .map(|j| j.record.clone()))
    }

    async fn get_jobs(&self, queue_name: &str, state: JobState) -> Result<Vec<JobRecord>, QueueError> {
        Ok(self
            .jobs
            .read()
            .values()
            .filter(|j| j.record.queue == queue_name && j.record.state == state)
            .map(|j| j.record.clone())
            .collect())
    }

    async fn get_job_counts(&self, queue_name: &str) -> Result<JobCounts, QueueError> {
        let mut counts = JobCounts::default();
        for job in self.jobs.read().values() {
            if job.record.queue != queue_name {
                continue;
            }
            match job.record.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Paused => counts.paused += 1,
            }
        }
        Ok(counts)
    }

    async fn is_paused(&self, queue_name: &str) -> Result<bool, QueueError> {
        Ok(*self.paused.read().get(queue_name).unwrap_or(&false))
    }

    async fn pause(&self, queue_name: &str) -> Result<(), QueueError> {
        self.paused.write().insert(queue_name.to_string(), true);
        Ok(())
    }

    async fn resume(&self, queue_name: &str) -> Result<(), QueueError> {
        self.paused.write().insert(queue_name.to_string(), false);
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

type StreamHandler = Box<dyn Fn(Value) + Send + Sync>;

/// In-memory pub/sub, no durability.
#[derive(Default)]
pub struct InMemoryStream {
    subscribers: RwLock<HashMap<String, Vec<(SubscriptionId, StreamHandler)>>>,
    by_id: RwLock<HashMap<SubscriptionId, String>>,
    next_id: AtomicI64,
}

impl InMemoryStream {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Stream for InMemoryStream {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), StreamError> {
        if let Some(handlers) = self.subscribers.read().get(topic) {
            for (_, handler) in handlers {
                handler(payload.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: StreamHandler) -> Result<SubscriptionId, StreamError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) as SubscriptionId;
        self.subscribers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        self.by_id.write().insert(id, topic.to_string());
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), StreamError> {
        if let Some(topic) = self.by_id.write().remove(&id) {
            if let Some(handlers) = self.subscribers.write().get_mut(&topic) {
                handlers.retain(|(h, _)| *h != id);
            }
        }
        Ok(())
    }

    async fn list_topics(&self) -> Result<Vec<String>, StreamError> {
        Ok(self.subscribers.read().keys().cloned().collect())
    }

    async fn shutdown(&self) -> Result<(), StreamError> {
        self.subscribers.write().clear();
        self.by_id.write().clear();
        Ok(())
    }
}
