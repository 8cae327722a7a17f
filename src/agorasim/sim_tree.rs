//! Branchable simulation trees and the process-wide registry.
//!
//! A simulation is a tree of [`BranchNode`]s. The root is created from a
//! validated [`ScenarioSpec`] plus initial agents; every other node is forked
//! from its parent by [`SimulationTree::branch`], which deep-copies the
//! parent state and applies an ordered list of [`PatchOp`]s. Two siblings of
//! the same parent share parent state exactly up to the fork point; their
//! divergence is fully explained by their patch ops.
//!
//! Concurrency discipline:
//!
//! - structural operations (create, branch, delete) serialise on the tree's
//!   internal lock;
//! - all mutation of a node's `agents`/`scene_state`/`log` flows through the
//!   single writer that holds the node's state mutex, the runner driving
//!   [`SimulationTree::run`];
//! - `status` transitions are guarded per node, so concurrent operations on
//!   a `running` branch are rejected with
//!   [`SimError::BranchContention`] instead of blocking;
//! - sibling branches share no mutable state and run fully in parallel.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agorasim::agent_state::AgentState;
//! use agorasim::client_wrapper::LlmBindings;
//! use agorasim::clients::mock::MockClient;
//! use agorasim::config::KernelConfig;
//! use agorasim::lm_pool::CancelToken;
//! use agorasim::observer::NullObserver;
//! use agorasim::scenario::{ActionGrammar, ScenarioSpec};
//! use agorasim::sim_tree::{PatchOp, SimulationTree};
//!
//! # async fn demo() -> Result<(), agorasim::error::SimError> {
//! let spec = ScenarioSpec::builder("pd", "Prisoner's Dilemma")
//!     .grammar(ActionGrammar::discrete("action", &["cooperate", "defect"]))
//!     .build()?;
//! let tree = SimulationTree::new(
//!     "sim-1",
//!     spec,
//!     vec![AgentState::new("Alice"), AgentState::new("Bob")],
//! )?;
//!
//! let bindings = LlmBindings::new(Arc::new(MockClient::always(r#"{"action":"cooperate"}"#)));
//! tree.run(
//!     tree.root(),
//!     2,
//!     &bindings,
//!     &KernelConfig::default(),
//!     Arc::new(NullObserver),
//!     CancelToken::never(),
//! )
//! .await?;
//!
//! let child = tree
//!     .branch(tree.root(), vec![PatchOp::agent_props(
//!         "Alice",
//!         serde_json::json!({"trust": 80}),
//!     )])
//!     .await?;
//! # let _ = child;
//! # Ok(())
//! # }
//! ```

use crate::agent_state::AgentState;
use crate::client_wrapper::LlmBindings;
use crate::config::KernelConfig;
use crate::error::SimError;
use crate::event_log::{EventLog, EventType};
use crate::lm_pool::CancelToken;
use crate::observer::SimObserver;
use crate::round::{run_round, RoundOutcome};
use crate::scenario::ScenarioSpec;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as AsyncMutex;

/// Scene-clock starting point, in minutes since midnight (18:00).
pub const DEFAULT_CLOCK_MINUTES: u32 = 1080;

const SUGGESTIONS_VIEWED_KEY: &str = "_suggestions_viewed_intervals";

/// Lifecycle status of a branch node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

/// The complete, independent state of one branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchState {
    pub scenario: ScenarioSpec,
    pub agents: HashMap<String, AgentState>,
    /// Declared iteration order. Event recording and sequential turns follow
    /// this order, never completion order.
    pub agent_order: Vec<String>,
    /// Opaque scene state: mechanic tallies, the scene clock (`time`), and
    /// acknowledged suggestion milestones.
    pub scene_state: serde_json::Map<String, serde_json::Value>,
    pub log: EventLog,
    /// Fully-completed rounds only.
    pub turns_completed: u32,
}

impl BranchState {
    /// Build the root state for a scenario. Validates the spec, enforces
    /// unique agent names, and lets the mechanics seed agent properties.
    pub fn new(scenario: ScenarioSpec, agents: Vec<AgentState>) -> Result<Self, SimError> {
        scenario.validate()?;
        if agents.is_empty() {
            return Err(SimError::Config("a simulation needs at least one agent".into()));
        }

        let mut agent_order = Vec::with_capacity(agents.len());
        let mut agent_map = HashMap::with_capacity(agents.len());
        for agent in agents {
            if agent_map.contains_key(&agent.name) {
                return Err(SimError::Config(format!(
                    "duplicate agent name '{}'",
                    agent.name
                )));
            }
            agent_order.push(agent.name.clone());
            agent_map.insert(agent.name.clone(), agent);
        }

        crate::mechanics::initialize_agents(&scenario, &mut agent_map, &agent_order);

        let mut scene_state = serde_json::Map::new();
        scene_state.insert("time".to_string(), json!(DEFAULT_CLOCK_MINUTES));

        Ok(Self {
            scenario,
            agents: agent_map,
            agent_order,
            scene_state,
            log: EventLog::new(),
            turns_completed: 0,
        })
    }

    /// Current scene-clock minutes.
    pub fn clock_minutes(&self) -> u32 {
        self.scene_state
            .get("time")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_CLOCK_MINUTES as u64) as u32
    }

    /// Advance the scene clock. Called by the post-turn hook.
    pub fn advance_clock(&mut self, minutes: u32) {
        let next = self.clock_minutes() + minutes;
        self.scene_state.insert("time".to_string(), json!(next));
    }

    /// The suggestion milestone covering the current turn count, if any.
    fn current_milestone(&self, interval: u32) -> Option<u32> {
        if interval == 0 || self.turns_completed < interval {
            return None;
        }
        Some((self.turns_completed / interval) * interval)
    }

    fn viewed_milestones(&self) -> Vec<u32> {
        self.scene_state
            .get(SUGGESTIONS_VIEWED_KEY)
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_u64()).map(|v| v as u32).collect())
            .unwrap_or_default()
    }

    /// Whether environment-event suggestions are currently available: a
    /// milestone has been reached and not yet acknowledged.
    pub fn suggestions_available(&self, interval: u32) -> bool {
        match self.current_milestone(interval) {
            Some(milestone) => !self.viewed_milestones().contains(&milestone),
            None => false,
        }
    }

    /// Mark the current milestone as acknowledged without logging anything.
    /// Returns the milestone, or `None` when nothing was pending. Used both
    /// by [`dismiss_suggestions`](BranchState::dismiss_suggestions) and when
    /// an environment event generated from a suggestion is actually applied.
    pub fn mark_suggestions_viewed(&mut self, interval: u32) -> Option<u32> {
        let milestone = match self.current_milestone(interval) {
            Some(m) if self.suggestions_available(interval) => m,
            _ => return None,
        };
        let mut viewed = self.viewed_milestones();
        viewed.push(milestone);
        self.scene_state
            .insert(SUGGESTIONS_VIEWED_KEY.to_string(), json!(viewed));
        Some(milestone)
    }

    /// Acknowledge the current milestone and record a
    /// `suggestion_dismissed` event. No-op when nothing is available.
    pub fn dismiss_suggestions(&mut self, interval: u32) {
        if let Some(milestone) = self.mark_suggestions_viewed(interval) {
            self.log.append(
                self.turns_completed,
                EventType::SuggestionDismissed,
                None,
                None,
                json!({"milestone": milestone}),
            );
        }
    }
}

/// Ordered list of patches applied when forking from a parent.
///
/// The vocabulary is closed at the kernel boundary; no extension points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    /// Merge `updates` into `agents[name].properties`. The agent must exist
    /// unless `create_if_missing` explicitly allows creating it.
    AgentPropsPatch {
        name: String,
        updates: serde_json::Map<String, serde_json::Value>,
        #[serde(default)]
        create_if_missing: bool,
    },
    /// Set a leaf value in `scene_state` at a dotted path, creating
    /// intermediate objects as needed.
    SceneStatePatch {
        path: String,
        value: serde_json::Value,
    },
    /// Append a synthetic entry to the child's log before any running.
    InjectEvent { payload: serde_json::Value },
    /// Drop events with `seq >= from`. Used to roll back mid-round state
    /// before branching.
    PruneEvents { from: u64 },
}

impl PatchOp {
    /// `agent_props_patch` from a JSON object of updates.
    pub fn agent_props(name: impl Into<String>, updates: serde_json::Value) -> Self {
        let updates = match updates {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        PatchOp::AgentPropsPatch {
            name: name.into(),
            updates,
            create_if_missing: false,
        }
    }

    /// Apply this op to a deep-copied branch state.
    pub fn apply(&self, state: &mut BranchState) -> Result<(), SimError> {
        match self {
            PatchOp::AgentPropsPatch {
                name,
                updates,
                create_if_missing,
            } => {
                if !state.agents.contains_key(name) {
                    if !*create_if_missing {
                        return Err(SimError::Config(format!(
                            "agent_props_patch targets unknown agent '{}'",
                            name
                        )));
                    }
                    state.agent_order.push(name.clone());
                    state.agents.insert(name.clone(), AgentState::new(name.clone()));
                }
                let agent = state
                    .agents
                    .get_mut(name)
                    .ok_or_else(|| SimError::System("agent vanished during patch".into()))?;
                for (key, value) in updates {
                    agent.properties.insert(key.clone(), value.clone());
                }
                Ok(())
            }
            PatchOp::SceneStatePatch { path, value } => {
                set_scene_leaf(&mut state.scene_state, path, value.clone())
            }
            PatchOp::InjectEvent { payload } => {
                state.log.append(
                    state.turns_completed,
                    EventType::EnvironmentEvent,
                    None,
                    None,
                    payload.clone(),
                );
                Ok(())
            }
            PatchOp::PruneEvents { from } => {
                state.log.prune_from(*from);
                Ok(())
            }
        }
    }
}

fn set_scene_leaf(
    scene_state: &mut serde_json::Map<String, serde_json::Value>,
    path: &str,
    value: serde_json::Value,
) -> Result<(), SimError> {
    let mut segments = path.split('.').peekable();
    let mut current = scene_state;
    loop {
        let segment = segments
            .next()
            .ok_or_else(|| SimError::Config("scene_state_patch path is empty".into()))?;
        if segment.is_empty() {
            return Err(SimError::Config(format!(
                "scene_state_patch path '{}' has an empty segment",
                path
            )));
        }
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return Ok(());
        }
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| json!({}));
        current = match entry.as_object_mut() {
            Some(map) => map,
            None => {
                return Err(SimError::Config(format!(
                    "scene_state_patch path '{}' crosses a non-object value at '{}'",
                    path, segment
                )))
            }
        };
    }
}

/// One vertex of a simulation tree.
pub struct BranchNode {
    pub id: u64,
    pub parent: Option<u64>,
    pub depth: u32,
    pub patch_ops: Vec<PatchOp>,
    pub created_at: DateTime<Utc>,
    status: StdMutex<NodeStatus>,
    state: AsyncMutex<BranchState>,
}

impl BranchNode {
    fn new(
        id: u64,
        parent: Option<u64>,
        depth: u32,
        patch_ops: Vec<PatchOp>,
        state: BranchState,
    ) -> Self {
        Self {
            id,
            parent,
            depth,
            patch_ops,
            created_at: Utc::now(),
            status: StdMutex::new(NodeStatus::Idle),
            state: AsyncMutex::new(state),
        }
    }

    /// Current status. Lock poisoning is treated as recoverable; the status
    /// value itself is always valid.
    pub fn status(&self) -> NodeStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: NodeStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Atomically transition idle → running. Anything else is contention.
    fn begin_run(&self) -> Result<(), SimError> {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *status != NodeStatus::Idle {
            return Err(SimError::BranchContention(format!(
                "node {} is {:?}, not idle",
                self.id, *status
            )));
        }
        *status = NodeStatus::Running;
        Ok(())
    }

    /// Borrow the branch state for inspection. Fails fast when the node is
    /// being driven by a runner.
    pub fn try_state(&self) -> Result<tokio::sync::MutexGuard<'_, BranchState>, SimError> {
        self.state.try_lock().map_err(|_| {
            SimError::BranchContention(format!("node {} state is held by its runner", self.id))
        })
    }
}

struct TreeInner {
    nodes: HashMap<u64, Arc<BranchNode>>,
    children: HashMap<u64, Vec<u64>>,
    root: u64,
    next_id: u64,
}

/// A tree of branch nodes for one simulation.
pub struct SimulationTree {
    pub sim_id: String,
    inner: StdMutex<TreeInner>,
}

impl SimulationTree {
    /// Create a tree with a fresh root from a scenario and initial agents.
    pub fn new(
        sim_id: impl Into<String>,
        scenario: ScenarioSpec,
        agents: Vec<AgentState>,
    ) -> Result<Arc<Self>, SimError> {
        let state = BranchState::new(scenario, agents)?;
        let root = Arc::new(BranchNode::new(0, None, 0, Vec::new(), state));
        let mut nodes = HashMap::new();
        nodes.insert(0, root);
        Ok(Arc::new(Self {
            sim_id: sim_id.into(),
            inner: StdMutex::new(TreeInner {
                nodes,
                children: HashMap::new(),
                root: 0,
                next_id: 1,
            }),
        }))
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, TreeInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Root node ID.
    pub fn root(&self) -> u64 {
        self.lock_inner().root
    }

    /// Look up a node.
    pub fn node(&self, id: u64) -> Option<Arc<BranchNode>> {
        self.lock_inner().nodes.get(&id).cloned()
    }

    fn require_node(&self, id: u64) -> Result<Arc<BranchNode>, SimError> {
        self.node(id)
            .ok_or_else(|| SimError::Config(format!("unknown node {}", id)))
    }

    /// Number of nodes in the tree.
    pub fn len(&self) -> usize {
        self.lock_inner().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_inner().nodes.is_empty()
    }

    /// Nodes with no children.
    pub fn leaves(&self) -> Vec<u64> {
        let inner = self.lock_inner();
        let mut leaves: Vec<u64> = inner
            .nodes
            .keys()
            .filter(|id| inner.children.get(*id).map(|c| c.is_empty()).unwrap_or(true))
            .cloned()
            .collect();
        leaves.sort_unstable();
        leaves
    }

    /// Node IDs currently under execution.
    pub fn running(&self) -> Vec<u64> {
        let inner = self.lock_inner();
        let mut running: Vec<u64> = inner
            .nodes
            .values()
            .filter(|node| node.status() == NodeStatus::Running)
            .map(|node| node.id)
            .collect();
        running.sort_unstable();
        running
    }

    /// Direct children of a node, in creation order.
    pub fn children_of(&self, id: u64) -> Vec<u64> {
        self.lock_inner().children.get(&id).cloned().unwrap_or_default()
    }

    /// Fork a child from `parent_id`: deep-copy the parent state, then apply
    /// each op in order. A failing op aborts the whole branch with no side
    /// effects on the tree.
    pub async fn branch(&self, parent_id: u64, ops: Vec<PatchOp>) -> Result<u64, SimError> {
        let parent = self.require_node(parent_id)?;
        if parent.status() == NodeStatus::Running {
            return Err(SimError::BranchContention(format!(
                "cannot branch from running node {}",
                parent_id
            )));
        }

        // Deep snapshot of the parent state. try_lock keeps the
        // single-writer discipline honest: a concurrent runner means
        // contention, not waiting.
        let mut state = parent.try_state()?.clone();
        for op in &ops {
            op.apply(&mut state)?;
        }

        let mut inner = self.lock_inner();
        let id = inner.next_id;
        inner.next_id += 1;
        let node = Arc::new(BranchNode::new(
            id,
            Some(parent_id),
            parent.depth + 1,
            ops,
            state,
        ));
        inner.nodes.insert(id, node);
        inner.children.entry(parent_id).or_default().push(id);

        log::info!(
            "sim {}: branched node {} from {} ({} ops)",
            self.sim_id,
            id,
            parent_id,
            inner.nodes[&id].patch_ops.len()
        );
        Ok(id)
    }

    /// Drive a node for up to `max_rounds` further rounds.
    ///
    /// Refuses when the node is not idle. The scenario's own `max_rounds` is
    /// a hard cap: the run completes when either budget is exhausted.
    /// Cancellation mid-round keeps completed agents' events, marks the
    /// round aborted in the log, and returns the node to idle with
    /// `turns_completed` reflecting fully-completed rounds only.
    pub async fn run(
        &self,
        node_id: u64,
        max_rounds: u32,
        bindings: &LlmBindings,
        config: &KernelConfig,
        observer: Arc<dyn SimObserver>,
        cancel: CancelToken,
    ) -> Result<NodeStatus, SimError> {
        let node = self.require_node(node_id)?;
        node.begin_run()?;

        // We own the running status, so the state lock is free.
        let mut state = match node.state.try_lock() {
            Ok(state) => state,
            Err(_) => {
                node.set_status(NodeStatus::Failed);
                return Err(SimError::System(format!(
                    "node {} state locked while idle",
                    node_id
                )));
            }
        };

        let scenario_cap = state.scenario.max_rounds;
        let budget_cap = state.turns_completed.saturating_add(max_rounds);
        let cap = scenario_cap.min(budget_cap);

        let mut aborted = false;
        while state.turns_completed < cap {
            let round = state.turns_completed + 1;
            observer.on_round_started(node_id, round).await;

            let outcome = run_round(
                &mut state,
                node_id,
                round,
                bindings,
                config,
                observer.clone(),
                cancel.clone(),
            )
            .await;

            match outcome {
                Ok(RoundOutcome::Completed) => {
                    state.turns_completed = round;
                    observer.on_round_completed(node_id, round, false).await;
                }
                Ok(RoundOutcome::Aborted) => {
                    observer.on_round_completed(node_id, round, true).await;
                    aborted = true;
                    break;
                }
                Err(err) => {
                    log::error!("sim {}: node {} round {} failed: {}", self.sim_id, node_id, round, err);
                    node.set_status(NodeStatus::Failed);
                    let turns = state.turns_completed;
                    drop(state);
                    observer
                        .on_run_completed(node_id, turns, NodeStatus::Failed)
                        .await;
                    return Err(err);
                }
            }
        }

        let final_status = if aborted {
            NodeStatus::Idle
        } else {
            NodeStatus::Completed
        };
        let turns = state.turns_completed;
        drop(state);
        node.set_status(final_status);
        observer.on_run_completed(node_id, turns, final_status).await;
        Ok(final_status)
    }

    /// Deep-serialise a node's state and patch-op chain.
    ///
    /// Snapshots are taken outside running windows, so they always reflect a
    /// consistent state.
    pub fn snapshot(&self, node_id: u64) -> Result<crate::snapshot::Snapshot, SimError> {
        let node = self.require_node(node_id)?;
        let status = node.status();
        if status == NodeStatus::Running {
            return Err(SimError::BranchContention(format!(
                "cannot snapshot running node {}",
                node_id
            )));
        }
        let state = node.try_state()?;
        Ok(crate::snapshot::Snapshot::capture(
            &state,
            node.id,
            node.parent,
            &node.patch_ops,
            status,
            node.created_at,
        ))
    }

    /// Fork a previously captured snapshot back into this tree as a child
    /// of the node it was taken from, applying `ops` on top.
    ///
    /// With empty ops the child's state equals the snapshotted state.
    pub async fn fork_snapshot(
        &self,
        snapshot: &crate::snapshot::Snapshot,
        ops: Vec<PatchOp>,
    ) -> Result<u64, SimError> {
        let mut state = snapshot.restore_state()?;
        for op in &ops {
            op.apply(&mut state)?;
        }

        let parent = snapshot.metadata.node_id;
        let depth = self
            .node(parent)
            .map(|n| n.depth + 1)
            .unwrap_or(0);

        let mut inner = self.lock_inner();
        let id = inner.next_id;
        inner.next_id += 1;
        let node = Arc::new(BranchNode::new(id, Some(parent), depth, ops, state));
        inner.nodes.insert(id, node);
        inner.children.entry(parent).or_default().push(id);
        Ok(id)
    }

    /// Remove a node and its whole subtree. Refuses while any node in the
    /// subtree is running.
    pub fn remove_subtree(&self, node_id: u64) -> Result<usize, SimError> {
        let mut inner = self.lock_inner();
        if node_id == inner.root {
            return Err(SimError::Config("cannot remove the root node".into()));
        }
        if !inner.nodes.contains_key(&node_id) {
            return Err(SimError::Config(format!("unknown node {}", node_id)));
        }

        let mut doomed = vec![node_id];
        let mut queue = vec![node_id];
        while let Some(id) = queue.pop() {
            for child in inner.children.get(&id).cloned().unwrap_or_default() {
                doomed.push(child);
                queue.push(child);
            }
        }

        for id in &doomed {
            if let Some(node) = inner.nodes.get(id) {
                if node.status() == NodeStatus::Running {
                    return Err(SimError::BranchContention(format!(
                        "node {} in subtree is running",
                        id
                    )));
                }
            }
        }

        for id in &doomed {
            inner.nodes.remove(id);
            inner.children.remove(id);
        }
        for children in inner.children.values_mut() {
            children.retain(|c| !doomed.contains(c));
        }
        Ok(doomed.len())
    }
}

/// Process-wide registry of simulation trees, keyed by simulation ID.
pub struct SimTreeRegistry {
    inner: StdMutex<HashMap<String, Arc<SimulationTree>>>,
}

lazy_static! {
    /// The shared registry. Structural operations on one simulation
    /// serialise on its tree's internal lock; the registry lock only guards
    /// the map itself.
    pub static ref SIM_TREE_REGISTRY: SimTreeRegistry = SimTreeRegistry {
        inner: StdMutex::new(HashMap::new()),
    };
}

impl SimTreeRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SimulationTree>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A fresh simulation ID.
    pub fn new_simulation_id(&self) -> String {
        format!("sim-{}", uuid::Uuid::new_v4())
    }

    /// Fetch an existing tree or create one from the given scenario and
    /// agents.
    pub fn get_or_create(
        &self,
        sim_id: &str,
        scenario: ScenarioSpec,
        agents: Vec<AgentState>,
    ) -> Result<Arc<SimulationTree>, SimError> {
        if let Some(existing) = self.lock().get(sim_id) {
            return Ok(existing.clone());
        }
        // Build outside the lock: tree construction validates the scenario.
        let tree = SimulationTree::new(sim_id, scenario, agents)?;
        let mut map = self.lock();
        Ok(map.entry(sim_id.to_string()).or_insert(tree).clone())
    }

    /// Look up a simulation.
    pub fn get(&self, sim_id: &str) -> Option<Arc<SimulationTree>> {
        self.lock().get(sim_id).cloned()
    }

    /// Drop a simulation from the registry. In-flight `Arc`s keep the tree
    /// alive until their owners finish.
    pub fn remove(&self, sim_id: &str) -> bool {
        self.lock().remove(sim_id).is_some()
    }

    /// IDs of all registered simulations.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
