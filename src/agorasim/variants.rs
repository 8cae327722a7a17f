//! Parallel execution of sibling variants and branch comparison.
//!
//! A variant is a sibling branch produced from the same parent with
//! different patch ops, used to A/B compare interventions. The executor:
//!
//! 1. creates each child via [`SimulationTree::branch`];
//! 2. submits all children to [`SimulationTree::run`] concurrently (sibling
//!    branches share no mutable state, so parallelism is unconstrained;
//! 3. publishes a [`VariantProgress`] through the observer as each run
//!    completes, in completion order;
//! 4. returns a map from variant name to child node ID.
//!
//! [`compare`] reports how two branches diverged: an event-log edit script
//! (via [`EventLog::align`](crate::event_log::EventLog::align)) plus
//! per-agent property deltas, including agents that exist on only one side.

use crate::client_wrapper::LlmBindings;
use crate::config::KernelConfig;
use crate::error::SimError;
use crate::event_log::LogDiff;
use crate::lm_pool::CancelToken;
use crate::observer::{SimObserver, VariantProgress};
use crate::sim_tree::{NodeStatus, PatchOp, SimulationTree};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One variant to fork and run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantSpec {
    pub name: String,
    #[serde(default)]
    pub ops: Vec<PatchOp>,
}

impl VariantSpec {
    pub fn new(name: impl Into<String>, ops: Vec<PatchOp>) -> Self {
        Self {
            name: name.into(),
            ops,
        }
    }

    /// A variant with no ops, the control arm.
    pub fn control(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }
}

/// Fork every variant off `parent_id` and run them concurrently for up to
/// `max_rounds` further rounds each.
///
/// Branch creation is serialised (structural ops always are); the runs
/// themselves proceed in parallel. A variant whose run fails is reported
/// through the observer with its final status and does not abort the
/// others.
pub async fn run_variants(
    tree: Arc<SimulationTree>,
    parent_id: u64,
    variants: Vec<VariantSpec>,
    max_rounds: u32,
    bindings: &LlmBindings,
    config: &KernelConfig,
    observer: Arc<dyn SimObserver>,
    cancel: CancelToken,
) -> Result<HashMap<String, u64>, SimError> {
    let mut mapping = HashMap::with_capacity(variants.len());

    for variant in &variants {
        let child = tree.branch(parent_id, variant.ops.clone()).await?;
        mapping.insert(variant.name.clone(), child);
    }

    let mut tasks = Vec::with_capacity(mapping.len());
    for variant in &variants {
        let node_id = mapping[&variant.name];
        let name = variant.name.clone();
        let tree = tree.clone();
        let bindings = bindings.clone();
        let config = config.clone();
        let observer = observer.clone();
        let cancel = cancel.clone();

        tasks.push(tokio::spawn(async move {
            let result = tree
                .run(
                    node_id,
                    max_rounds,
                    &bindings,
                    &config,
                    observer.clone(),
                    cancel,
                )
                .await;

            let status = match &result {
                Ok(status) => *status,
                Err(err) => {
                    log::error!("variant '{}' (node {}) failed: {}", name, node_id, err);
                    tree.node(node_id)
                        .map(|n| n.status())
                        .unwrap_or(NodeStatus::Failed)
                }
            };
            let turns_completed = tree
                .node(node_id)
                .and_then(|n| n.try_state().ok().map(|s| s.turns_completed))
                .unwrap_or(0);

            // Progress is published in completion order, not submission
            // order.
            observer
                .on_variant_progress(&VariantProgress {
                    name: name.clone(),
                    node_id,
                    turns_completed,
                    status,
                })
                .await;
        }));
    }

    for task in tasks {
        task.await
            .map_err(|err| SimError::System(format!("variant task panicked: {}", err)))?;
    }

    Ok(mapping)
}

/// How one property differs between two branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyChange {
    pub from: serde_json::Value,
    pub to: serde_json::Value,
}

/// Per-agent property deltas between two branches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentDiff {
    /// The agent exists on the left branch.
    pub present_in_a: bool,
    /// The agent exists on the right branch.
    pub present_in_b: bool,
    /// Properties only the right branch has.
    pub added: BTreeMap<String, serde_json::Value>,
    /// Properties only the left branch has.
    pub removed: BTreeMap<String, serde_json::Value>,
    /// Properties present on both sides with different values.
    pub changed: BTreeMap<String, PropertyChange>,
}

impl AgentDiff {
    pub fn is_empty(&self) -> bool {
        self.present_in_a
            && self.present_in_b
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.changed.is_empty()
    }
}

/// Full comparison of two sibling (or any two) branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareReport {
    pub event_diff: LogDiff,
    /// Keyed by agent name; only agents with a non-empty diff appear.
    pub agent_diffs: BTreeMap<String, AgentDiff>,
}

/// Compare two nodes of the same tree. Both must be outside a running
/// window.
pub fn compare(
    tree: &SimulationTree,
    node_a: u64,
    node_b: u64,
    max_evidence: usize,
) -> Result<CompareReport, SimError> {
    let a = tree
        .node(node_a)
        .ok_or_else(|| SimError::Config(format!("unknown node {}", node_a)))?;
    let b = tree
        .node(node_b)
        .ok_or_else(|| SimError::Config(format!("unknown node {}", node_b)))?;

    let state_a = a.try_state()?;
    let state_b = b.try_state()?;

    let event_diff = state_a.log.align(&state_b.log, max_evidence);

    let mut agent_diffs = BTreeMap::new();
    let mut names: Vec<&String> = state_a.agents.keys().collect();
    for name in state_b.agents.keys() {
        if !state_a.agents.contains_key(name) {
            names.push(name);
        }
    }

    for name in names {
        let left = state_a.agents.get(name);
        let right = state_b.agents.get(name);
        let mut diff = AgentDiff {
            present_in_a: left.is_some(),
            present_in_b: right.is_some(),
            ..AgentDiff::default()
        };

        match (left, right) {
            (Some(left), Some(right)) => {
                for (key, value) in &left.properties {
                    match right.properties.get(key) {
                        Some(other) if other == value => {}
                        Some(other) => {
                            diff.changed.insert(
                                key.clone(),
                                PropertyChange {
                                    from: value.clone(),
                                    to: other.clone(),
                                },
                            );
                        }
                        None => {
                            diff.removed.insert(key.clone(), value.clone());
                        }
                    }
                }
                for (key, value) in &right.properties {
                    if !left.properties.contains_key(key) {
                        diff.added.insert(key.clone(), value.clone());
                    }
                }
            }
            (Some(left), None) => {
                diff.removed = left.properties.clone();
            }
            (None, Some(right)) => {
                diff.added = right.properties.clone();
            }
            (None, None) => {}
        }

        if !diff.is_empty() {
            agent_diffs.insert(name.clone(), diff);
        }
    }

    Ok(CompareReport {
        event_diff,
        agent_diffs,
    })
}
