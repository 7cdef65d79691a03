//! Flow run and await-state entities (spec.md §3.1 "Flow run",
//! "Await-state").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::await_subsystem::AwaitKind;

/// Terminal-or-not status of a flow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Awaiting,
    Completed,
    Failed,
    Canceled,
    Stalled,
}

impl RunStatus {
    /// Invariant 2 (spec.md §3.2): a terminal run never transitions further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Canceled | RunStatus::Stalled
        )
    }
}

/// Before/after position of an await relative to its step's body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitPosition {
    Before,
    After,
}

impl AwaitPosition {
    pub fn as_str(self) -> &'static str {
        match self {
            AwaitPosition::Before => "before",
            AwaitPosition::After => "after",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "before" => Some(AwaitPosition::Before),
            "after" => Some(AwaitPosition::After),
            _ => None,
        }
    }

    /// The composite key `"{stepName}:{before|after}"` used in
    /// `awaitingSteps` (spec.md §3.1, §4.2.4).
    pub fn key(self, step_name: &str) -> String {
        format!("{step_name}:{}", self.as_str())
    }
}

/// Resolution status of one await registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitStatus {
    Awaiting,
    Resolved,
    Timeout,
}

/// Per-step-position await record (spec.md §3.1 "Await-state").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwaitState {
    pub status: AwaitStatus,
    pub await_type: AwaitKind,
    pub registered_at: i64,
    pub timeout_at: Option<i64>,
    pub position: AwaitPosition,
    pub trigger_data: Option<Value>,
    pub config: Value,
}

/// Mutable run metadata, the single shared mutable resource of the
/// orchestrator (spec.md §5 "Shared-resource policy"), owned by the Store's
/// sorted index entry keyed by `runIndex(flowName)` (spec.md §3.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRun {
    pub run_id: String,
    pub flow_name: String,
    pub status: RunStatus,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub step_count: u32,
    pub completed_steps: u32,
    /// Nested dot-path -> timestamp tree, append-only (invariant 6).
    pub emitted_events: Value,
    pub awaiting_steps: HashMap<String, AwaitState>,
    pub last_error: Option<String>,
    pub stall_reason: Option<String>,
    pub previous_status: Option<RunStatus>,
    /// Optimistic-concurrency cursor (spec.md §9).
    pub version: u64,
}

impl FlowRun {
    pub fn new(run_id: impl Into<String>, flow_name: impl Into<String>, started_at: i64) -> Self {
        Self {
            run_id: run_id.into(),
            flow_name: flow_name.into(),
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            step_count: 0,
            completed_steps: 0,
            emitted_events: Value::Object(Default::default()),
            awaiting_steps: HashMap::new(),
            last_error: None,
            stall_reason: None,
            previous_status: None,
            version: 0,
        }
    }
}

/// Generate a `runId` of the form `"{flowName}-{epochMs}-{rand}"`
/// (spec.md §3.1).
pub fn new_run_id(flow_name: &str) -> String {
    use rand::Rng;
    let epoch_ms = crate::model::event::now_ms();
    let rand_suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{flow_name}-{epoch_ms}-{rand_suffix:06}")
}
