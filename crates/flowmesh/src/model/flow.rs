//! Flow and step definitions, and the analysis that turns a definition into
//! an executable dependency graph (spec.md §3.1 "Flow definition",
//! "Analyzed flow").

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::await_subsystem::{AwaitConfig, TimeoutAction};

/// One node in a flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub queue: String,
    pub worker_id: String,
    /// Event tokens this step waits on: either a dot-path emitted elsewhere
    /// in the run, or `"step:{name}"` for another step's completion.
    pub subscribes: Vec<String>,
    /// Dot-paths this step may emit.
    pub emits: Vec<String>,
    pub await_before: Option<AwaitConfig>,
    pub await_after: Option<AwaitConfig>,
    pub step_timeout: Duration,
}

impl StepDefinition {
    pub fn new(queue: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            worker_id: worker_id.into(),
            subscribes: Vec::new(),
            emits: Vec::new(),
            await_before: None,
            await_after: None,
            step_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_subscribes(mut self, subscribes: impl IntoIterator<Item = String>) -> Self {
        self.subscribes = subscribes.into_iter().collect();
        self
    }

    pub fn with_emits(mut self, emits: impl IntoIterator<Item = String>) -> Self {
        self.emits = emits.into_iter().collect();
        self
    }

    pub fn with_await_before(mut self, config: AwaitConfig) -> Self {
        self.await_before = Some(config);
        self
    }

    pub fn with_await_after(mut self, config: AwaitConfig) -> Self {
        self.await_after = Some(config);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Names of other steps this step depends on via `"step:{name}"` tokens.
    fn step_dependencies(&self) -> impl Iterator<Item = &str> {
        self.subscribes
            .iter()
            .filter_map(|token| token.strip_prefix("step:"))
    }
}

/// Immutable flow graph, supplied by an external registry (spec.md §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    pub entry_step: Option<String>,
    pub steps: HashMap<String, StepDefinition>,
}

impl FlowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry_step: None,
            steps: HashMap::new(),
        }
    }

    pub fn with_entry_step(mut self, name: impl Into<String>) -> Self {
        self.entry_step = Some(name.into());
        self
    }

    pub fn with_step(mut self, name: impl Into<String>, step: StepDefinition) -> Self {
        self.steps.insert(name.into(), step);
        self
    }

    /// Build [`AnalyzedFlow`] from this definition: dependency graph,
    /// topological execution levels, and `stall_timeout`.
    pub fn analyze(&self) -> AnalyzedFlow {
        AnalyzedFlow::from_definition(self.clone())
    }
}

/// Flow definition augmented with the dependency graph, topological
/// execution levels, and the computed outer stall deadline (spec.md §3.1).
#[derive(Debug, Clone)]
pub struct AnalyzedFlow {
    pub definition: FlowDefinition,
    /// step name -> set of step names it depends on (via `step:` tokens).
    pub dependencies: HashMap<String, HashSet<String>>,
    /// step name -> set of step names that depend on it.
    pub dependents: HashMap<String, HashSet<String>>,
    /// Topological layers: `levels[0]` has no step-dependencies, each
    /// subsequent level depends only on steps in earlier levels.
    pub levels: Vec<Vec<String>>,
    pub stall_timeout: Duration,
}

impl AnalyzedFlow {
    pub fn from_definition(definition: FlowDefinition) -> Self {
        let mut dependencies: HashMap<String, HashSet<String>> = HashMap::new();
        let mut dependents: HashMap<String, HashSet<String>> = HashMap::new();

        for (name, step) in &definition.steps {
            let deps: HashSet<String> = step.step_dependencies().map(String::from).collect();
            for dep in &deps {
                dependents.entry(dep.clone()).or_default().insert(name.clone());
            }
            dependencies.insert(name.clone(), deps);
            dependents.entry(name.clone()).or_default();
        }

        let levels = topological_levels(&dependencies);
        let stall_timeout = compute_stall_timeout(&definition, &levels);

        Self {
            definition,
            dependencies,
            dependents,
            levels,
            stall_timeout,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.definition.steps.get(name)
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.definition.steps.keys().map(String::as_str)
    }

    /// True if `name` is a leaf of the dependency graph (nothing depends on it).
    pub fn is_leaf(&self, name: &str) -> bool {
        self.dependents.get(name).is_none_or(HashSet::is_empty)
    }

    /// The layer containing `name`, i.e. the set of steps sharing the same
    /// dependency set (spec.md GLOSSARY "Layer"), used by critical-layer
    /// failure detection (§4.2.7).
    pub fn layer_of<'a>(&'a self, name: &str) -> Vec<&'a str> {
        let Some(target_deps) = self.dependencies.get(name) else {
            return vec![];
        };
        self.dependencies
            .iter()
            .filter(|(_, deps)| *deps == target_deps)
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

/// Kahn's algorithm over the step-dependency graph. Steps with no
/// dependency form level 0; cycles (which the spec doesn't anticipate, since
/// `step:` tokens describe a DAG by construction) leave any remaining nodes
/// out of the result rather than looping forever.
fn topological_levels(dependencies: &HashMap<String, HashSet<String>>) -> Vec<Vec<String>> {
    let mut remaining: HashMap<String, HashSet<String>> = dependencies.clone();
    let mut levels = Vec::new();

    while !remaining.is_empty() {
        let ready: Vec<String> = remaining
            .iter()
            .filter(|(_, deps)| deps.iter().all(|d| !remaining.contains_key(d)))
            .map(|(name, _)| name.clone())
            .collect();
        if ready.is_empty() {
            // Cyclic or dangling dependency reference; stop to avoid looping.
            break;
        }
        for name in &ready {
            remaining.remove(name);
        }
        levels.push(ready);
    }
    levels
}

const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Sum across layers of `max(step_timeout + await_timeout)` within the
/// layer, plus a `max(10%, 5 min)` buffer; default 30 min if the flow has no
/// awaits at all (spec.md §3.1).
fn compute_stall_timeout(definition: &FlowDefinition, levels: &[Vec<String>]) -> Duration {
    let mut has_await = false;
    let mut total = Duration::ZERO;

    for level in levels {
        let mut layer_max = Duration::ZERO;
        for name in level {
            let Some(step) = definition.steps.get(name) else { continue };
            let mut cost = step.step_timeout;
            if let Some(cfg) = &step.await_before {
                has_await = true;
                cost += cfg.timeout_or_default();
            }
            if let Some(cfg) = &step.await_after {
                has_await = true;
                cost += cfg.timeout_or_default();
            }
            layer_max = layer_max.max(cost);
        }
        total += layer_max;
    }

    if !has_await {
        return DEFAULT_STALL_TIMEOUT;
    }

    let buffer = (total / 10).max(Duration::from_secs(5 * 60));
    total + buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::await_subsystem::AwaitKind;

    fn linear_flow() -> FlowDefinition {
        FlowDefinition::new("f1")
            .with_entry_step("E")
            .with_step("E", StepDefinition::new("q", "w").with_emits(["a".to_string()]))
            .with_step(
                "S1",
                StepDefinition::new("q", "w")
                    .with_subscribes(["a".to_string()])
                    .with_emits(["b".to_string()]),
            )
            .with_step("S2", StepDefinition::new("q", "w").with_subscribes(["step:S1".to_string()]))
    }

    #[test]
    fn analyze_builds_dependency_graph_from_step_tokens() {
        let analyzed = linear_flow().analyze();
        assert!(analyzed.dependencies["S2"].contains("S1"));
        assert!(analyzed.dependencies["S1"].is_empty());
        assert!(analyzed.dependents["S1"].contains("S2"));
    }

    #[test]
    fn analyze_produces_topological_levels() {
        let analyzed = linear_flow().analyze();
        // E and S1 have no step: deps, S2 depends on S1 only via step: token
        assert!(analyzed.levels[0].contains(&"E".to_string()));
        assert!(analyzed.levels[0].contains(&"S1".to_string()));
        assert_eq!(analyzed.levels[1], vec!["S2".to_string()]);
    }

    #[test]
    fn stall_timeout_defaults_to_30_min_without_awaits() {
        let analyzed = linear_flow().analyze();
        assert_eq!(analyzed.stall_timeout, Duration::from_secs(30 * 60));
    }

    #[test]
    fn stall_timeout_sums_layers_with_buffer_when_awaits_present() {
        let flow = FlowDefinition::new("f4").with_entry_step("E").with_step(
            "E",
            StepDefinition::new("q", "w").with_await_after(AwaitConfig {
                kind: AwaitKind::Time,
                delay: Some(Duration::from_secs(60)),
                timeout: None,
                timeout_action: TimeoutAction::Fail,
                cron: None,
                timezone: None,
                event_pattern: None,
            }),
        );
        let analyzed = flow.analyze();
        assert!(analyzed.stall_timeout > Duration::from_secs(300 + 60));
    }

    #[test]
    fn leaf_detection_matches_dependents() {
        let analyzed = linear_flow().analyze();
        assert!(analyzed.is_leaf("S2"));
        assert!(!analyzed.is_leaf("S1"));
    }
}
