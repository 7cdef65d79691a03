//! In-memory flow definition registry.
//!
//! Build-time step scanning and code loading are out of scope (spec.md §3.1
//! "supplied by an external registry") — this only holds already-analyzed
//! flows so the orchestrator, trigger wiring, and stall detector can look
//! one up by name.

use std::sync::Arc;

use dashmap::DashMap;

use crate::model::{AnalyzedFlow, FlowDefinition};

pub struct FlowRegistry {
    flows: DashMap<String, Arc<AnalyzedFlow>>,
}

impl FlowRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { flows: DashMap::new() })
    }

    /// Analyze and register a flow definition, replacing any prior
    /// registration under the same name.
    pub fn register(&self, definition: FlowDefinition) -> Arc<AnalyzedFlow> {
        let analyzed = Arc::new(definition.analyze());
        self.flows.insert(analyzed.definition.name.clone(), analyzed.clone());
        analyzed
    }

    pub fn get(&self, flow_name: &str) -> Option<Arc<AnalyzedFlow>> {
        self.flows.get(flow_name).map(|e| e.clone())
    }

    pub fn flow_names(&self) -> Vec<String> {
        self.flows.iter().map(|e| e.key().clone()).collect()
    }
}
