use agorasim::agent_state::AgentState;
use agorasim::client_wrapper::LlmBindings;
use agorasim::clients::mock::MockClient;
use agorasim::config::KernelConfig;
use agorasim::event_log::EventType;
use agorasim::lm_pool::{CancelSource, CancelToken};
use agorasim::observer::{NullObserver, SimObserver};
use agorasim::scenario::{ActionGrammar, ScenarioSpec, Visibility};
use agorasim::sim_tree::{NodeStatus, SimulationTree};
use agorasim::turn::ActionOutcome;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> KernelConfig {
    KernelConfig {
        llm_attempts: 1,
        backoff_base: Duration::from_millis(1),
        ..KernelConfig::default()
    }
}

fn pd_spec(visibility: Visibility) -> ScenarioSpec {
    ScenarioSpec::builder("pd", "Prisoner's Dilemma")
        .grammar(ActionGrammar::discrete("action", &["cooperate", "defect"]))
        .visibility(visibility)
        .max_rounds(10)
        .build()
        .unwrap()
}

/// Cancels the run right after Alice's round-4 action is recorded, before
/// Bob's turn starts.
struct CancelAfterAliceRound4 {
    source: CancelSource,
}

#[async_trait]
impl SimObserver for CancelAfterAliceRound4 {
    async fn on_agent_acted(
        &self,
        _node_id: u64,
        round: u32,
        agent: &str,
        _outcome: &ActionOutcome,
    ) {
        if round == 4 && agent == "Alice" {
            self.source.cancel();
        }
    }
}

#[tokio::test]
async fn test_cancel_mid_round_keeps_partial_round_and_returns_idle() {
    let bindings = LlmBindings::new(Arc::new(MockClient::always(r#"{"action":"cooperate"}"#)));
    let tree = SimulationTree::new(
        "c1",
        pd_spec(Visibility::Sequential),
        vec![AgentState::new("Alice"), AgentState::new("Bob")],
    )
    .unwrap();

    let (source, token) = CancelSource::new();
    let observer = Arc::new(CancelAfterAliceRound4 { source });

    let status = tree
        .run(tree.root(), 10, &bindings, &fast_config(), observer, token)
        .await
        .unwrap();

    // Only fully-completed rounds count; the node is idle again.
    assert_eq!(status, NodeStatus::Idle);
    let node = tree.node(tree.root()).unwrap();
    assert_eq!(node.status(), NodeStatus::Idle);

    let state = node.try_state().unwrap();
    assert_eq!(state.turns_completed, 3);

    // The aborted marker sits at the round-4 boundary.
    let marker = state
        .log
        .entries()
        .iter()
        .find(|e| e.payload["code"] == "round_aborted")
        .expect("aborted round is marked in the log");
    assert_eq!(marker.payload["round"], 4);
    assert_eq!(marker.kind, EventType::SystemBroadcast);

    // Alice acted in round 4; Bob did not.
    let round4_actions: Vec<_> = state
        .log
        .entries()
        .iter()
        .filter(|e| e.kind == EventType::AgentAction && e.turn == 4)
        .collect();
    assert_eq!(round4_actions.len(), 1);
    assert_eq!(round4_actions[0].sender.as_deref(), Some("Alice"));

    // Alice's memory reflects her round-4 action; Bob's does not.
    let count_actions = |name: &str| -> usize {
        state.agents[name]
            .short_memory
            .entries()
            .iter()
            .map(|e| e.content.matches("chose").count())
            .sum()
    };
    assert_eq!(count_actions("Alice"), 4);
    assert_eq!(count_actions("Bob"), 3);
}

#[tokio::test]
async fn test_cancelled_node_can_resume_from_idle() {
    let bindings = LlmBindings::new(Arc::new(MockClient::always(r#"{"action":"cooperate"}"#)));
    let tree = SimulationTree::new(
        "c2",
        pd_spec(Visibility::Sequential),
        vec![AgentState::new("Alice"), AgentState::new("Bob")],
    )
    .unwrap();

    let (source, token) = CancelSource::new();
    let observer = Arc::new(CancelAfterAliceRound4 { source });
    tree.run(tree.root(), 10, &bindings, &fast_config(), observer, token)
        .await
        .unwrap();

    // A fresh run picks up where the completed rounds left off.
    let status = tree
        .run(
            tree.root(),
            1,
            &bindings,
            &fast_config(),
            Arc::new(NullObserver),
            CancelToken::never(),
        )
        .await
        .unwrap();
    assert_eq!(status, NodeStatus::Completed);

    let node = tree.node(tree.root()).unwrap();
    let state = node.try_state().unwrap();
    assert_eq!(state.turns_completed, 4);
}

#[tokio::test]
async fn test_cancel_during_simultaneous_fanout_aborts_cleanly() {
    // Both agents' LM calls are in flight when the cancel lands.
    let slow = Arc::new(
        MockClient::always(r#"{"action":"cooperate"}"#).with_delay(Duration::from_millis(400)),
    );
    let bindings = LlmBindings::new(slow);
    let tree = SimulationTree::new(
        "c3",
        pd_spec(Visibility::Simultaneous),
        vec![AgentState::new("Alice"), AgentState::new("Bob")],
    )
    .unwrap();

    let (source, token) = CancelSource::new();
    let run_tree = tree.clone();
    let run_bindings = bindings.clone();
    let handle = tokio::spawn(async move {
        run_tree
            .run(
                run_tree.root(),
                5,
                &run_bindings,
                &fast_config(),
                Arc::new(NullObserver),
                token,
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(80)).await;
    source.cancel();
    let status = handle.await.unwrap().unwrap();

    assert_eq!(status, NodeStatus::Idle);
    let node = tree.node(tree.root()).unwrap();
    let state = node.try_state().unwrap();
    assert_eq!(state.turns_completed, 0);

    // Nobody's action was recorded; the abort marker is the only trace.
    assert!(state
        .log
        .entries()
        .iter()
        .all(|e| e.kind != EventType::AgentAction));
    assert!(state
        .log
        .entries()
        .iter()
        .any(|e| e.payload["code"] == "round_aborted"));
    assert!(state.agents["Alice"].short_memory.is_empty());
}
