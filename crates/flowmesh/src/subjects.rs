//! Subject and index-key naming conventions (spec.md §6.2).
//!
//! Centralized here so the orchestrator, trigger wiring, and stall detector
//! agree on exactly one name for each durable stream/index without
//! duplicating the format string at each call site.

/// Per-run event stream: `flowRun(runId)`.
pub fn flow_run_subject(run_id: &str) -> String {
    format!("flow-run:{run_id}")
}

/// Sorted index of runs for one flow, keyed by `runId`: `flowRunIndex(flowName)`.
pub fn flow_run_index_key(flow_name: &str) -> String {
    format!("flow-run-index:{flow_name}")
}

/// Sorted index of flows with aggregate stats, keyed by `flowName`: `flowIndex()`.
pub fn flow_index_key() -> &'static str {
    "flow-index"
}

/// Per-trigger event stream: `triggerStream(name)`.
pub fn trigger_stream_subject(name: &str) -> String {
    format!("trigger-stream:{name}")
}

/// Sorted index of triggers with stats, keyed by trigger name: `triggerIndex()`.
pub fn trigger_index_key() -> &'static str {
    "trigger-index"
}
