//! Per-evaluation snapshot of a run's event stream (spec.md §4.2.6, §4.2.7).
//!
//! `completedSteps`/"step failed" membership isn't kept as separate run-index
//! state; it's derived from the run's own stream, which is already the
//! source of truth and already has to be scanned for the await-after race
//! fallback. This also gives pending-step evaluation the raw emit payloads,
//! which the `emittedEvents` tree deliberately does not carry (its leaves
//! are timestamps, spec.md invariant 6) — see DESIGN.md.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::adapters::{StoreError, StreamEvent, StreamFilter, StreamStore};

pub struct RunContext {
    pub completed_steps: HashSet<String>,
    pub failed_steps: HashSet<String>,
    pub emit_payloads: HashMap<String, Value>,
    pub entry_input: Value,
    pub canceled: bool,
    /// `"{stepName}:{before|after}"` keys with a persisted `await.resolved`
    /// or `await.timeout` — the race-fallback source of truth for §4.2.6
    /// step 3, independent of the (possibly lagging) run-index snapshot.
    pub settled_awaits: HashSet<String>,
}

impl RunContext {
    pub async fn load(stream: &dyn StreamStore, subject: &str) -> Result<Self, StoreError> {
        let events = stream.read(subject, StreamFilter::default()).await?;
        Ok(Self::from_events(&events))
    }

    fn from_events(events: &[StreamEvent]) -> Self {
        let mut completed = HashSet::new();
        let mut failed = HashSet::new();
        let mut last_retry_id: HashMap<String, i64> = HashMap::new();
        let mut emit_payloads = HashMap::new();
        let mut entry_input = Value::Null;
        let mut canceled = false;
        let mut settled_awaits = HashSet::new();

        for ev in events {
            match ev.event_type.as_str() {
                "step.completed" => {
                    if let Some(step) = step_name_of(ev) {
                        completed.insert(step.to_string());
                        failed.remove(step);
                    }
                }
                "step.retry" => {
                    if let Some(step) = step_name_of(ev) {
                        last_retry_id.insert(step.to_string(), ev.id);
                    }
                }
                "step.failed" => {
                    if let Some(step) = step_name_of(ev) {
                        let last_retry = last_retry_id.get(step).copied().unwrap_or(-1);
                        if ev.id > last_retry {
                            failed.insert(step.to_string());
                        } else {
                            failed.remove(step);
                        }
                    }
                }
                "emit" => {
                    if let Some(name) = ev.payload.get("data").and_then(|d| d.get("name")).and_then(|v| v.as_str()) {
                        let payload = ev.payload.get("data").and_then(|d| d.get("payload")).cloned().unwrap_or(Value::Null);
                        emit_payloads.insert(name.to_string(), payload);
                    }
                }
                "flow.start" => {
                    entry_input = ev.payload.get("data").and_then(|d| d.get("input")).cloned().unwrap_or(Value::Null);
                }
                "flow.cancel" => canceled = true,
                "await.resolved" | "await.timeout" => {
                    if let (Some(step), Some(position)) = (
                        step_name_of(ev),
                        ev.payload.get("data").and_then(|d| d.get("position")).and_then(|v| v.as_str()),
                    ) {
                        settled_awaits.insert(format!("{step}:{position}"));
                    }
                }
                _ => {}
            }
        }

        Self {
            completed_steps: completed,
            failed_steps: failed,
            emit_payloads,
            entry_input,
            canceled,
            settled_awaits,
        }
    }
}

fn step_name_of(ev: &StreamEvent) -> Option<&str> {
    ev.payload.get("step_name").and_then(|v| v.as_str())
}
