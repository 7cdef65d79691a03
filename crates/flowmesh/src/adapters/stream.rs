//! Stream adapter contract: pub/sub only, used by the stream bridge to
//! forward persisted events to external subscribers (spec.md §2 row 9,
//! §6.1). Distinct from [`crate::adapters::store::StreamStore`], which is
//! the durable append-only per-subject log.

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("topic {0:?} not found")]
    TopicNotFound(String),
    #[error("stream backend error: {0}")]
    Backend(String),
}

pub type SubscriptionId = u64;

/// Pub/sub broadcast contract, intentionally with no durability guarantees —
/// a crashed subscriber simply misses messages published while it was down.
/// The event bus and the durable Store are what give the orchestrator its
/// at-least-once guarantees; this trait is for fan-out to observers only.
#[async_trait]
pub trait Stream: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), StreamError>;

    async fn subscribe(
        &self,
        topic: &str,
        handler: Box<dyn Fn(Value) + Send + Sync>,
    ) -> Result<SubscriptionId, StreamError>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), StreamError>;

    async fn list_topics(&self) -> Result<Vec<String>, StreamError>;

    async fn shutdown(&self) -> Result<(), StreamError>;
}
