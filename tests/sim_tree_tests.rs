use agorasim::agent_state::AgentState;
use agorasim::client_wrapper::LlmBindings;
use agorasim::clients::mock::MockClient;
use agorasim::config::KernelConfig;
use agorasim::error::SimError;
use agorasim::event_log::EventType;
use agorasim::lm_pool::{CancelSource, CancelToken};
use agorasim::observer::NullObserver;
use agorasim::scenario::{ActionGrammar, ScenarioSpec};
use agorasim::sim_tree::{NodeStatus, PatchOp, SimulationTree, SIM_TREE_REGISTRY};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn pd_spec() -> ScenarioSpec {
    ScenarioSpec::builder("pd", "Prisoner's Dilemma")
        .grammar(ActionGrammar::discrete("action", &["cooperate", "defect"]))
        .max_rounds(10)
        .build()
        .unwrap()
}

fn agents() -> Vec<AgentState> {
    vec![AgentState::new("Alice"), AgentState::new("Bob")]
}

fn fast_config() -> KernelConfig {
    KernelConfig {
        llm_attempts: 1,
        backoff_base: Duration::from_millis(1),
        ..KernelConfig::default()
    }
}

#[test]
fn test_new_tree_has_single_idle_root() {
    let tree = SimulationTree::new("t1", pd_spec(), agents()).unwrap();
    assert_eq!(tree.root(), 0);
    assert_eq!(tree.len(), 1);
    assert_eq!(tree.leaves(), vec![0]);
    assert!(tree.running().is_empty());
    assert_eq!(tree.node(0).unwrap().status(), NodeStatus::Idle);
}

#[test]
fn test_duplicate_agent_names_rejected() {
    let result = SimulationTree::new(
        "t2",
        pd_spec(),
        vec![AgentState::new("Alice"), AgentState::new("Alice")],
    );
    assert!(matches!(result, Err(SimError::Config(_))));
}

#[tokio::test]
async fn test_agent_props_patch_merges_updates() {
    let tree = SimulationTree::new("t3", pd_spec(), agents()).unwrap();
    let child = tree
        .branch(
            tree.root(),
            vec![PatchOp::agent_props("Alice", json!({"trust": 10, "role": "leader"}))],
        )
        .await
        .unwrap();

    let node = tree.node(child).unwrap();
    let state = node.try_state().unwrap();
    assert_eq!(state.agents["Alice"].properties["trust"], 10);
    assert_eq!(state.agents["Alice"].properties["role"], "leader");

    // Parent untouched.
    let root_node = tree.node(tree.root()).unwrap();
    let root_state = root_node.try_state().unwrap();
    assert!(root_state.agents["Alice"].properties.get("trust").is_none());
}

#[tokio::test]
async fn test_agent_props_patch_unknown_agent_fails_without_create_flag() {
    let tree = SimulationTree::new("t4", pd_spec(), agents()).unwrap();
    let result = tree
        .branch(
            tree.root(),
            vec![PatchOp::agent_props("Mallory", json!({"trust": 1}))],
        )
        .await;
    assert!(matches!(result, Err(SimError::Config(_))));
    // A failing op leaves no child behind.
    assert_eq!(tree.len(), 1);
}

#[tokio::test]
async fn test_agent_props_patch_can_create_when_allowed() {
    let tree = SimulationTree::new("t5", pd_spec(), agents()).unwrap();
    let mut updates = serde_json::Map::new();
    updates.insert("role".to_string(), json!("observer"));
    let child = tree
        .branch(
            tree.root(),
            vec![PatchOp::AgentPropsPatch {
                name: "Mallory".to_string(),
                updates,
                create_if_missing: true,
            }],
        )
        .await
        .unwrap();

    let node = tree.node(child).unwrap();
    let state = node.try_state().unwrap();
    assert!(state.agents.contains_key("Mallory"));
    assert_eq!(state.agent_order.last().map(|s| s.as_str()), Some("Mallory"));
}

#[tokio::test]
async fn test_scene_state_patch_sets_nested_leaf() {
    let tree = SimulationTree::new("t6", pd_spec(), agents()).unwrap();
    let child = tree
        .branch(
            tree.root(),
            vec![PatchOp::SceneStatePatch {
                path: "weather.sky".to_string(),
                value: json!("overcast"),
            }],
        )
        .await
        .unwrap();

    let node = tree.node(child).unwrap();
    let state = node.try_state().unwrap();
    assert_eq!(state.scene_state["weather"]["sky"], "overcast");
}

#[tokio::test]
async fn test_inject_event_lands_before_any_running() {
    let tree = SimulationTree::new("t7", pd_spec(), agents()).unwrap();
    let child = tree
        .branch(
            tree.root(),
            vec![PatchOp::InjectEvent {
                payload: json!({"summary": "A storm rolls in."}),
            }],
        )
        .await
        .unwrap();

    let node = tree.node(child).unwrap();
    let state = node.try_state().unwrap();
    let entry = &state.log.entries()[0];
    assert_eq!(entry.kind, EventType::EnvironmentEvent);
    assert_eq!(entry.payload["summary"], "A storm rolls in.");
}

#[tokio::test]
async fn test_prune_events_rolls_back_log() {
    let tree = SimulationTree::new("t8", pd_spec(), agents()).unwrap();
    // Seed the root log with a few injected events through a first branch.
    let seeded = tree
        .branch(
            tree.root(),
            vec![
                PatchOp::InjectEvent { payload: json!({"n": 1}) },
                PatchOp::InjectEvent { payload: json!({"n": 2}) },
                PatchOp::InjectEvent { payload: json!({"n": 3}) },
            ],
        )
        .await
        .unwrap();

    let pruned = tree
        .branch(seeded, vec![PatchOp::PruneEvents { from: 1 }])
        .await
        .unwrap();

    let node = tree.node(pruned).unwrap();
    let state = node.try_state().unwrap();
    assert_eq!(state.log.len(), 1);
    assert_eq!(state.log.next_seq(), 1);
}

#[tokio::test]
async fn test_child_divergence_is_isolated_from_parent_and_sibling() {
    let tree = SimulationTree::new("t9", pd_spec(), agents()).unwrap();
    let left = tree
        .branch(tree.root(), vec![PatchOp::agent_props("Alice", json!({"trust": 1}))])
        .await
        .unwrap();
    let right = tree
        .branch(tree.root(), vec![PatchOp::agent_props("Alice", json!({"trust": 2}))])
        .await
        .unwrap();

    let left_node = tree.node(left).unwrap();
    let left_state = left_node.try_state().unwrap();
    let right_node = tree.node(right).unwrap();
    let right_state = right_node.try_state().unwrap();
    assert_eq!(left_state.agents["Alice"].properties["trust"], 1);
    assert_eq!(right_state.agents["Alice"].properties["trust"], 2);

    assert_eq!(tree.children_of(tree.root()), vec![left, right]);
    assert_eq!(tree.leaves(), vec![left, right]);
}

#[tokio::test]
async fn test_run_refuses_non_idle_node() {
    let bindings = LlmBindings::new(Arc::new(MockClient::always(r#"{"action":"cooperate"}"#)));
    let tree = SimulationTree::new("t10", pd_spec(), agents()).unwrap();

    tree.run(
        tree.root(),
        1,
        &bindings,
        &fast_config(),
        Arc::new(NullObserver),
        CancelToken::never(),
    )
    .await
    .unwrap();
    assert_eq!(tree.node(tree.root()).unwrap().status(), NodeStatus::Completed);

    let again = tree
        .run(
            tree.root(),
            1,
            &bindings,
            &fast_config(),
            Arc::new(NullObserver),
            CancelToken::never(),
        )
        .await;
    assert!(matches!(again, Err(SimError::BranchContention(_))));
}

#[tokio::test]
async fn test_branch_from_running_node_is_contention() {
    let slow = Arc::new(
        MockClient::always(r#"{"action":"cooperate"}"#).with_delay(Duration::from_millis(300)),
    );
    let bindings = LlmBindings::new(slow);
    let tree = SimulationTree::new("t11", pd_spec(), agents()).unwrap();

    let (source, token) = CancelSource::new();
    let run_tree = tree.clone();
    let run_bindings = bindings.clone();
    let handle = tokio::spawn(async move {
        run_tree
            .run(
                run_tree.root(),
                1,
                &run_bindings,
                &fast_config(),
                Arc::new(NullObserver),
                token,
            )
            .await
    });

    // Let the run acquire the node.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tree.running(), vec![tree.root()]);

    let result = tree.branch(tree.root(), vec![]).await;
    assert!(matches!(result, Err(SimError::BranchContention(_))));

    source.cancel();
    handle.await.unwrap().unwrap();
}

#[test]
fn test_suggestion_milestones_and_dismissal() {
    let tree = SimulationTree::new("t12", pd_spec(), agents()).unwrap();
    let node = tree.node(tree.root()).unwrap();
    let mut state = node.try_state().unwrap();

    let interval = 5;
    assert!(!state.suggestions_available(interval));

    state.turns_completed = 5;
    assert!(state.suggestions_available(interval));

    state.turns_completed = 6;
    assert!(state.suggestions_available(interval));

    state.dismiss_suggestions(interval);
    assert!(!state.suggestions_available(interval));
    assert_eq!(
        state.log.entries().last().unwrap().kind,
        EventType::SuggestionDismissed
    );

    state.turns_completed = 10;
    assert!(state.suggestions_available(interval));
}

#[tokio::test]
async fn test_suggestions_viewed_is_per_branch() {
    let tree = SimulationTree::new("t13", pd_spec(), agents()).unwrap();
    {
        let node = tree.node(tree.root()).unwrap();
        let mut state = node.try_state().unwrap();
        state.turns_completed = 5;
        state.dismiss_suggestions(5);
        assert!(!state.suggestions_available(5));
    }

    // The child inherits the parent's viewed set by deep copy, but later
    // dismissals diverge per branch.
    let child = tree.branch(tree.root(), vec![]).await.unwrap();
    {
        let node = tree.node(child).unwrap();
        let mut state = node.try_state().unwrap();
        assert!(!state.suggestions_available(5));
        state.turns_completed = 10;
        assert!(state.suggestions_available(5));
        state.dismiss_suggestions(5);
    }

    let root_node = tree.node(tree.root()).unwrap();
    let root_state = root_node.try_state().unwrap();
    assert_eq!(root_state.turns_completed, 5);
    assert!(!root_state.suggestions_available(5));
}

#[tokio::test]
async fn test_remove_subtree() {
    let tree = SimulationTree::new("t14", pd_spec(), agents()).unwrap();
    let child = tree.branch(tree.root(), vec![]).await.unwrap();
    let grandchild = tree.branch(child, vec![]).await.unwrap();
    assert_eq!(tree.len(), 3);

    let removed = tree.remove_subtree(child).unwrap();
    assert_eq!(removed, 2);
    assert_eq!(tree.len(), 1);
    assert!(tree.node(grandchild).is_none());
    assert_eq!(tree.leaves(), vec![tree.root()]);
}

#[test]
fn test_registry_get_or_create_and_remove() {
    let sim_id = SIM_TREE_REGISTRY.new_simulation_id();
    let tree = SIM_TREE_REGISTRY
        .get_or_create(&sim_id, pd_spec(), agents())
        .unwrap();

    // Second call returns the same tree rather than rebuilding it.
    let same = SIM_TREE_REGISTRY
        .get_or_create(&sim_id, pd_spec(), agents())
        .unwrap();
    assert!(Arc::ptr_eq(&tree, &same));

    assert!(SIM_TREE_REGISTRY.list().contains(&sim_id));
    assert!(SIM_TREE_REGISTRY.remove(&sim_id));
    assert!(SIM_TREE_REGISTRY.get(&sim_id).is_none());
}
