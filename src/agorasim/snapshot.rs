//! Serialisable branch snapshots.
//!
//! A snapshot is the round-trippable representation of one branch's full
//! state: scenario, agents (as an ordered list), scene state, event log,
//! patch-op chain, and node metadata. The kernel does not persist snapshots
//! itself (persistence is the outer layer's job) but guarantees the
//! round-trip law `deserialise(serialise(node)) == node` and that snapshots
//! are forkable back into a tree via
//! [`SimulationTree::fork_snapshot`](crate::sim_tree::SimulationTree::fork_snapshot).
//!
//! # Example
//!
//! ```rust,no_run
//! # fn demo(tree: &agorasim::sim_tree::SimulationTree) -> Result<(), agorasim::error::SimError> {
//! let snap = tree.snapshot(tree.root())?;
//! let json = snap.to_json()?;
//! let restored = agorasim::snapshot::Snapshot::from_json(&json)?;
//! assert_eq!(snap, restored);
//! # Ok(())
//! # }
//! ```

use crate::agent_state::AgentState;
use crate::error::SimError;
use crate::event_log::{EventEntry, EventLog};
use crate::scenario::ScenarioSpec;
use crate::sim_tree::{BranchState, NodeStatus, PatchOp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Node bookkeeping carried alongside the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub node_id: u64,
    pub parent_id: Option<u64>,
    pub turns_completed: u32,
    pub status: NodeStatus,
    pub created_at: DateTime<Utc>,
}

/// A deep-serialised branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub scenario: ScenarioSpec,
    /// Agents in declared iteration order.
    pub agents: Vec<AgentState>,
    pub scene_state: serde_json::Map<String, serde_json::Value>,
    pub log: Vec<EventEntry>,
    pub patch_ops: Vec<PatchOp>,
    pub metadata: SnapshotMetadata,
}

impl Snapshot {
    /// Capture a branch state. Called by the tree with the node's state lock
    /// held (outside any running window).
    pub fn capture(
        state: &BranchState,
        node_id: u64,
        parent_id: Option<u64>,
        patch_ops: &[PatchOp],
        status: NodeStatus,
        created_at: DateTime<Utc>,
    ) -> Self {
        let agents = state
            .agent_order
            .iter()
            .filter_map(|name| state.agents.get(name).cloned())
            .collect();
        Self {
            scenario: state.scenario.clone(),
            agents,
            scene_state: state.scene_state.clone(),
            log: state.log.entries().to_vec(),
            patch_ops: patch_ops.to_vec(),
            metadata: SnapshotMetadata {
                node_id,
                parent_id,
                turns_completed: state.turns_completed,
                status,
                created_at,
            },
        }
    }

    /// Rebuild the branch state this snapshot was taken from.
    pub fn restore_state(&self) -> Result<BranchState, SimError> {
        let mut agent_order = Vec::with_capacity(self.agents.len());
        let mut agents = HashMap::with_capacity(self.agents.len());
        for agent in &self.agents {
            if agents.contains_key(&agent.name) {
                return Err(SimError::System(format!(
                    "snapshot contains duplicate agent '{}'",
                    agent.name
                )));
            }
            agent_order.push(agent.name.clone());
            agents.insert(agent.name.clone(), agent.clone());
        }
        Ok(BranchState {
            scenario: self.scenario.clone(),
            agents,
            agent_order,
            scene_state: self.scene_state.clone(),
            log: EventLog::from_entries(self.log.clone()),
            turns_completed: self.metadata.turns_completed,
        })
    }

    /// Serialise to a JSON document.
    pub fn to_json(&self) -> Result<String, SimError> {
        serde_json::to_string_pretty(self).map_err(SimError::from_serde)
    }

    /// Deserialise from a JSON document.
    pub fn from_json(json: &str) -> Result<Snapshot, SimError> {
        serde_json::from_str(json).map_err(SimError::from_serde)
    }
}
