//! Adapter contracts consumed by the orchestrator: Queue, Store, Stream.
//!
//! These are described only at the interface level (spec.md §6.1) — this
//! crate does not ship a Redis- or Postgres-backed implementation. The
//! `memory` module provides a single-process reference implementation of
//! all three, used by this crate's own test suite, matching the teacher's
//! `InMemoryWorkflowEventStore` ("primarily for testing").

pub mod memory;
pub mod queue;
pub mod store;
pub mod stream;

pub use queue::{EnqueueOptions, JobCounts, JobOptions, JobRecord, JobState, Queue, QueueError};
pub use store::{
    IndexEntry, IndexStore, KvStore, ReadDirection, StoreError, StreamEvent, StreamFilter,
    StreamStore,
};
pub use stream::{Stream, StreamError};
