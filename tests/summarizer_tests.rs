use agorasim::agent_state::AgentState;
use agorasim::client_wrapper::{ChatOptions, LlmBindings, LlmClient, Message};
use agorasim::clients::mock::MockClient;
use agorasim::config::KernelConfig;
use agorasim::lm_pool::CancelToken;
use agorasim::observer::NullObserver;
use agorasim::scenario::{ActionGrammar, ScenarioSpec};
use agorasim::sim_tree::{NodeStatus, SimulationTree};
use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> KernelConfig {
    KernelConfig {
        llm_attempts: 1,
        backoff_base: Duration::from_millis(1),
        ..KernelConfig::default()
    }
}

#[tokio::test]
async fn test_round_refreshes_rolling_summary_with_cleaned_text() {
    let spec = ScenarioSpec::builder("chat", "Chat")
        .grammar(ActionGrammar::discrete("action", &["wait"]))
        .summary_threshold(500)
        .build()
        .unwrap();

    // First call answers the action, second call answers the summary
    // request with stray quoting.
    let client = Arc::new(MockClient::scripted(vec![
        r#"{"action": "wait"}"#.to_string(),
        "\"  Alice waited out the first round.  \"".to_string(),
    ]));
    let bindings = LlmBindings::new(client);

    let tree = SimulationTree::new("sum1", spec, vec![AgentState::new("Alice")]).unwrap();
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

    let node = tree.node(tree.root()).unwrap();
    let state = node.try_state().unwrap();
    assert_eq!(
        state.agents["Alice"].rolling_summary,
        "Alice waited out the first round."
    );
}

#[tokio::test]
async fn test_summary_is_truncated_to_threshold() {
    let spec = ScenarioSpec::builder("chat", "Chat")
        .grammar(ActionGrammar::discrete("action", &["wait"]))
        .summary_threshold(20)
        .build()
        .unwrap();

    let client = Arc::new(MockClient::scripted(vec![
        r#"{"action": "wait"}"#.to_string(),
        "This summary is far longer than the twenty character cap.".to_string(),
    ]));
    let bindings = LlmBindings::new(client);

    let tree = SimulationTree::new("sum2", spec, vec![AgentState::new("Alice")]).unwrap();
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

    let node = tree.node(tree.root()).unwrap();
    let state = node.try_state().unwrap();
    assert_eq!(state.agents["Alice"].rolling_summary.chars().count(), 20);
    assert_eq!(state.agents["Alice"].rolling_summary, "This summary is far ");
}

/// Answers actions normally and fails every summary-refresh call.
struct SummaryBackendDown;

#[async_trait]
impl LlmClient for SummaryBackendDown {
    async fn chat(
        &self,
        messages: &[Message],
        _options: &ChatOptions,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let rendered: String = messages
            .iter()
            .map(|m| m.content.as_ref())
            .collect::<Vec<_>>()
            .join("\n");
        if rendered.contains("running summary") || rendered.contains("initial summary") {
            return Err("summary backend down".into());
        }
        Ok(r#"{"action": "wait"}"#.to_string())
    }

    fn model_name(&self) -> &str {
        "summary-backend-down"
    }
}

#[tokio::test]
async fn test_summary_failure_keeps_previous_summary_and_logs_warning() {
    let spec = ScenarioSpec::builder("chat", "Chat")
        .grammar(ActionGrammar::discrete("action", &["wait"]))
        .build()
        .unwrap();

    let mut alice = AgentState::new("Alice");
    alice.rolling_summary = "The beginning.".to_string();

    let bindings = LlmBindings::new(Arc::new(SummaryBackendDown));
    let tree = SimulationTree::new("sum3", spec, vec![alice]).unwrap();
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

    // The failure is tolerated: the round still completes.
    assert_eq!(status, NodeStatus::Completed);

    let node = tree.node(tree.root()).unwrap();
    let state = node.try_state().unwrap();
    assert_eq!(state.agents["Alice"].rolling_summary, "The beginning.");
    assert!(state
        .log
        .entries()
        .iter()
        .any(|e| e.payload["code"] == "summary_refresh_failed"));
}
