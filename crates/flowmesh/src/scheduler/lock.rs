//! Distributed lock used by the scheduler to guarantee at most one instance
//! executes a given job id at a time (spec.md §4.4.2, invariant 7).

use std::sync::Arc;
use std::time::Duration;

use crate::adapters::{IndexStore, KvStore, ReadDirection, StoreError};
use crate::model::now_ms;

/// Whether the Store's `kv` sub-API gives atomic compare-and-swap.
///
/// The in-memory reference adapter is exclusive *within one process*, but a
/// real multi-instance KV backend (plain Redis `GET`/`SET` without `SET NX`,
/// a file store, etc.) generally is not — the scheduler surfaces this via a
/// one-time `tracing::warn!` at construction rather than silently
/// replicating the raciness (spec.md §9 Open Questions).
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCapabilities {
    pub exclusive_kv: bool,
}

enum Backend {
    Index(Arc<dyn IndexStore>),
    Kv(Arc<dyn KvStore>),
}

/// Lease-style lock over a single logical key (the scheduler's
/// `{prefix}:scheduler:locks` index, or its KV-mode fallback).
pub struct DistributedLock {
    backend: Backend,
    locks_key: String,
    ttl: Duration,
    instance_id: String,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
struct LockMetadata {
    instance_id: String,
    acquired_at: i64,
    expires_at: i64,
}

impl DistributedLock {
    /// Prefer index mode when the Store supports sorted-index add
    /// (spec.md §4.4.2).
    pub fn index_mode(index: Arc<dyn IndexStore>, locks_key: impl Into<String>, ttl: Duration, instance_id: impl Into<String>) -> Self {
        Self {
            backend: Backend::Index(index),
            locks_key: locks_key.into(),
            ttl,
            instance_id: instance_id.into(),
        }
    }

    /// KV-mode fallback. Logs once that this mode cannot give atomic
    /// cross-instance exclusivity unless `capabilities.exclusive_kv`.
    pub fn kv_mode(
        kv: Arc<dyn KvStore>,
        locks_key: impl Into<String>,
        ttl: Duration,
        instance_id: impl Into<String>,
        capabilities: StoreCapabilities,
    ) -> Self {
        if !capabilities.exclusive_kv {
            tracing::warn!(
                "scheduler distributed lock running in KV-mode without an exclusive-CAS backend: \
                 concurrent instances have no safe locking guarantee (spec §4.4.2/§9)"
            );
        }
        Self {
            backend: Backend::Kv(kv),
            locks_key: locks_key.into(),
            ttl,
            instance_id: instance_id.into(),
        }
    }

    fn kv_key(&self, job_id: &str) -> String {
        format!("{}:{job_id}", self.locks_key)
    }

    /// Attempt to acquire the lock for `job_id`. Returns `true` on success.
    pub async fn try_acquire(&self, job_id: &str) -> Result<bool, StoreError> {
        let now = now_ms();
        let expires_at = now + self.ttl.as_millis() as i64;
        let metadata = LockMetadata {
            instance_id: self.instance_id.clone(),
            acquired_at: now,
            expires_at,
        };

        match &self.backend {
            Backend::Index(index) => {
                let value = serde_json::to_value(&metadata).expect("LockMetadata serializes");
                if index.add(&self.locks_key, job_id, expires_at as f64, value.clone()).await? {
                    return Ok(true);
                }
                // Conflict: check whether the existing entry has expired.
                let Some(existing) = index.get(&self.locks_key, job_id).await? else {
                    return Ok(false);
                };
                if (existing.score as i64) < now {
                    index.delete(&self.locks_key, job_id).await?;
                    return Ok(index.add(&self.locks_key, job_id, expires_at as f64, value).await?);
                }
                Ok(false)
            }
            Backend::Kv(kv) => {
                let key = self.kv_key(job_id);
                if let Some(existing) = kv.get(&key).await? {
                    let existing: LockMetadata = serde_json::from_value(existing).unwrap_or(LockMetadata {
                        instance_id: String::new(),
                        acquired_at: 0,
                        expires_at: 0,
                    });
                    if existing.expires_at > now {
                        return Ok(false);
                    }
                    kv.delete(&key).await?;
                }
                let value = serde_json::to_value(&metadata).expect("LockMetadata serializes");
                kv.set(&key, value, Some(self.ttl)).await?;
                Ok(true)
            }
        }
    }

    /// Renew the lock's `expiresAt`, only if still owned by this instance.
    pub async fn renew(&self, job_id: &str) -> Result<bool, StoreError> {
        let now = now_ms();
        let expires_at = now + self.ttl.as_millis() as i64;
        match &self.backend {
            Backend::Index(index) => {
                let Some(existing) = index.get(&self.locks_key, job_id).await? else {
                    return Ok(false);
                };
                let owner: LockMetadata = serde_json::from_value(existing.metadata.clone()).map_err(|e| StoreError::Backend(e.to_string()))?;
                if owner.instance_id != self.instance_id {
                    return Ok(false);
                }
                let metadata = serde_json::to_value(&LockMetadata {
                    instance_id: self.instance_id.clone(),
                    acquired_at: owner.acquired_at,
                    expires_at,
                })
                .expect("serializes");
                Ok(index.update(&self.locks_key, job_id, existing.version, metadata).await?)
            }
            Backend::Kv(kv) => {
                let key = self.kv_key(job_id);
                let Some(existing) = kv.get(&key).await? else {
                    return Ok(false);
                };
                let owner: LockMetadata = serde_json::from_value(existing).map_err(|e| StoreError::Backend(e.to_string()))?;
                if owner.instance_id != self.instance_id {
                    return Ok(false);
                }
                let metadata = serde_json::to_value(&LockMetadata {
                    instance_id: self.instance_id.clone(),
                    acquired_at: owner.acquired_at,
                    expires_at,
                })
                .expect("serializes");
                kv.set(&key, metadata, Some(self.ttl)).await?;
                Ok(true)
            }
        }
    }

    /// Unconditionally delete the lock entry for `job_id`.
    pub async fn release(&self, job_id: &str) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Index(index) => index.delete(&self.locks_key, job_id).await,
            Backend::Kv(kv) => kv.delete(&self.kv_key(job_id)).await,
        }
    }

    /// Release every lock currently owned by this instance — used on
    /// `stop()` (spec.md §4.4.5). Only meaningful in index mode, where all
    /// locks share one sorted index we can scan; KV mode has no listing
    /// capability in the contract, so this is a no-op there (locks expire
    /// via TTL instead).
    pub async fn release_all_owned(&self) -> Result<(), StoreError> {
        let Backend::Index(index) = &self.backend else {
            return Ok(());
        };
        let entries = index.read(&self.locks_key, ReadDirection::Ascending, 0, 10_000).await?;
        for entry in entries {
            if let Ok(owner) = serde_json::from_value::<LockMetadata>(entry.metadata.clone()) {
                if owner.instance_id == self.instance_id {
                    index.delete(&self.locks_key, &entry.id).await?;
                }
            }
        }
        Ok(())
    }
}
