//! Store adapter contract: stream + kv + sorted-index sub-APIs (spec.md §6.1).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Errors surfaced by any of the Store sub-APIs.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("subject {0:?} not found")]
    SubjectNotFound(String),
    #[error("key {0:?} not found")]
    KeyNotFound(String),
    #[error("index entry {key:?}/{id:?} not found")]
    IndexEntryNotFound { key: String, id: String },
    #[error("optimistic concurrency conflict on {key:?}/{id:?}: expected version {expected}, got {actual}")]
    VersionConflict {
        key: String,
        id: String,
        expected: u64,
        actual: u64,
    },
    #[error("store backend error: {0}")]
    Backend(String),
}

/// An event as persisted by [`StreamStore::append`].
///
/// `id` is adapter-assigned and monotonic within a subject; `ts` is
/// unix-ms. These two fields are exactly what distinguishes a "persisted"
/// copy of an event from the "ingress" copy the bus first dispatches
/// (spec.md §4.1).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StreamEvent {
    pub id: i64,
    pub ts: i64,
    pub event_type: String,
    pub payload: Value,
}

/// Filter accepted by [`StreamStore::read`].
#[derive(Debug, Clone, Default)]
pub struct StreamFilter {
    pub types: Option<Vec<String>>,
    pub after: Option<i64>,
    pub before: Option<i64>,
    pub from_ts: Option<i64>,
    pub to_ts: Option<i64>,
    pub limit: Option<usize>,
    pub descending: bool,
}

/// Append-only per-subject event stream.
#[async_trait]
pub trait StreamStore: Send + Sync + 'static {
    /// Append one event, returning it with its assigned `id`/`ts`.
    async fn append(&self, subject: &str, event_type: &str, payload: Value) -> Result<StreamEvent, StoreError>;

    /// Read events from a subject, newest-first when `filter.descending`.
    async fn read(&self, subject: &str, filter: StreamFilter) -> Result<Vec<StreamEvent>, StoreError>;

    /// Delete an entire subject's stream (administrative purge only).
    async fn delete(&self, subject: &str) -> Result<(), StoreError>;
}

/// Plain key-value sub-API, used by the scheduler for job/stats persistence
/// and as the fallback distributed-lock backend.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, key: &str, value: Value, ttl: Option<std::time::Duration>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Delete all keys matching a simple glob-style pattern (`prefix:*`).
    async fn clear(&self, pattern: &str) -> Result<u64, StoreError>;

    /// Atomically increment a numeric key by `by`, returning the new value.
    /// Non-existent keys start at 0.
    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError>;
}

/// An entry in a sorted index, keyed by `(index_key, id)` and ordered by `score`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub score: f64,
    pub version: u64,
    pub metadata: Value,
}

/// Read order for [`IndexStore::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    Ascending,
    Descending,
}

/// Sorted-index sub-API backing run indices, trigger indices, and the
/// scheduler's job/lock indices.
///
/// `update`/`update_with_retry` merge `metadata` into the stored entry using
/// [`crate::value::merge_deep`] (dot-path keys expand to nested objects,
/// `null` leaves delete fields) and bump `version` on success.
#[async_trait]
pub trait IndexStore: Send + Sync + 'static {
    /// Add a new entry. Returns `Ok(false)` without writing if `id` already
    /// exists (callers needing compare-and-swap use this for lock
    /// acquisition: spec.md §4.4.2 index-mode lock).
    async fn add(
        &self,
        index_key: &str,
        id: &str,
        score: f64,
        metadata: Value,
    ) -> Result<bool, StoreError>;

    async fn get(&self, index_key: &str, id: &str) -> Result<Option<IndexEntry>, StoreError>;

    async fn read(
        &self,
        index_key: &str,
        direction: ReadDirection,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<IndexEntry>, StoreError>;

    /// Optimistic merge-update. Returns `Ok(false)` (no write) if
    /// `expected_version` doesn't match the entry's current version.
    async fn update(
        &self,
        index_key: &str,
        id: &str,
        expected_version: u64,
        metadata: Value,
    ) -> Result<bool, StoreError>;

    /// Retry `update` with the latest version on conflict, up to
    /// `max_retries` times with exponential backoff, per spec.md §4.2.9.
    async fn update_with_retry(
        &self,
        index_key: &str,
        id: &str,
        metadata: Value,
        max_retries: u32,
    ) -> Result<IndexEntry, StoreError> {
        let mut attempt = 0u32;
        loop {
            let current = self
                .get(index_key, id)
                .await?
                .ok_or_else(|| StoreError::IndexEntryNotFound {
                    key: index_key.to_string(),
                    id: id.to_string(),
                })?;
            if self
                .update(index_key, id, current.version, metadata.clone())
                .await?
            {
                return self.get(index_key, id).await?.ok_or_else(|| {
                    StoreError::IndexEntryNotFound {
                        key: index_key.to_string(),
                        id: id.to_string(),
                    }
                });
            }
            attempt += 1;
            if attempt > max_retries {
                return Err(StoreError::VersionConflict {
                    key: index_key.to_string(),
                    id: id.to_string(),
                    expected: current.version,
                    actual: current.version + 1,
                });
            }
            let backoff = std::time::Duration::from_millis(10u64.saturating_mul(1 << attempt.min(6)));
            tokio::time::sleep(backoff).await;
        }
    }

    /// Atomically increment a numeric field within an entry's metadata.
    async fn increment(
        &self,
        index_key: &str,
        id: &str,
        field: &str,
        by: i64,
    ) -> Result<i64, StoreError>;

    async fn delete(&self, index_key: &str, id: &str) -> Result<(), StoreError>;
}

/// Marker alias used where code needs "now" in the same unit the adapters use.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}
