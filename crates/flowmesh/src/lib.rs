//! Durable workflow orchestration engine.
//!
//! Drives flow runs through a graph of steps connected by emit/subscribe
//! tokens, with await patterns, a durable job scheduler, a trigger registry,
//! and a stall detector, all wired onto one in-process [`bus::EventBus`].
//! [`runtime::Runtime`] is the crate's single entry point; everything else
//! is reachable through it rather than through module-level globals.

pub mod adapters;
pub mod await_subsystem;
pub mod bus;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod stall;
pub mod subjects;
pub mod trigger;
pub mod value;

pub use runtime::{Runtime, RuntimeConfig, RuntimeError};
