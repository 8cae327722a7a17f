//! Per-agent rolling-summary refresh.
//!
//! After each completed round the runner calls [`update_summaries`] exactly
//! once per agent. The summariser asks the agent's LM for a concise (2-4
//! sentence) update of the running summary, folds in the round's events, and
//! replaces
//! [`AgentState::rolling_summary`](crate::agent_state::AgentState::rolling_summary),
//! trimmed of stray quoting and truncated to the scenario's
//! `summary_threshold`.
//!
//! Failure is tolerated by design: the previous summary is kept, a warning
//! is logged, and a warning event lands in the branch log. A failed summary
//! refresh never fails the round.

use crate::client_wrapper::{ChatOptions, LlmBindings, Message, Role};
use crate::config::KernelConfig;
use crate::event_log::EventType;
use crate::lm_pool::{CancelToken, LmPool};
use crate::prompt::EventView;
use crate::sim_tree::BranchState;
use serde_json::json;

/// Build the refresh prompt: an "update" form when a summary already
/// exists, an "initial" form otherwise.
fn build_summary_prompt(current: &str, events_text: &str, round: u32) -> String {
    if current.is_empty() {
        format!(
            "Create an initial summary for this agent after round {}.\n\n\
             Events:\n{}\n\n\
             Return a concise summary (2-4 sentences). No markdown.",
            round, events_text
        )
    } else {
        format!(
            "Update this agent's running summary with new round events.\n\n\
             Current summary:\n{}\n\n\
             New events from round {}:\n{}\n\n\
             Return ONLY the updated summary (2-4 sentences). Keep it concise. No markdown.",
            current, round, events_text
        )
    }
}

/// Strip whitespace and stray wrapping quotes from an LM summary.
fn clean_summary(raw: &str) -> String {
    raw.trim().trim_matches(|c| c == '"' || c == '\'').trim().to_string()
}

/// Truncate at a character boundary.
fn truncate_to(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }
    text.chars().take(max_chars).collect()
}

/// Refresh every agent's rolling summary with the given round's events.
///
/// Invoked exactly once per agent per completed round. Each agent's own LM
/// binding is used, so heterogeneous simulations summarise with the same
/// model that drives the agent.
pub async fn update_summaries(
    state: &mut BranchState,
    bindings: &LlmBindings,
    pool: &LmPool,
    config: &KernelConfig,
    round: u32,
    cancel: CancelToken,
) {
    let round_view = EventView::live(&state.log, round);
    let events_text: String = round_view
        .lines()
        .iter()
        .map(|line| format!("- {}", line))
        .collect::<Vec<_>>()
        .join("\n");

    if events_text.is_empty() {
        log::debug!("no events to summarise for round {}", round);
        return;
    }

    let threshold = state.scenario.summary_threshold;
    let options = ChatOptions {
        json_mode: false,
        schema: None,
        max_tokens: None,
        deadline: Some(config.llm_call_timeout),
    };

    let order = state.agent_order.clone();
    for name in order {
        let (prompt, client) = {
            let agent = match state.agents.get(&name) {
                Some(agent) => agent,
                None => continue,
            };
            let client = match bindings.resolve(&agent.llm_binding) {
                Some(client) => client,
                None => continue,
            };
            (
                build_summary_prompt(&agent.rolling_summary, &events_text, round),
                client,
            )
        };

        let result = pool
            .call_with_retry(
                client,
                vec![Message::new(Role::User, prompt)],
                options.clone(),
                config.llm_attempts,
                config.backoff_base,
                cancel.clone(),
            )
            .await;

        match result {
            Ok(raw) => {
                let summary = truncate_to(clean_summary(&raw), threshold);
                if let Some(agent) = state.agents.get_mut(&name) {
                    log::debug!("updated summary for {}: {:.50}", name, summary);
                    agent.rolling_summary = summary;
                }
            }
            Err(failure) => {
                // Keep the previous summary and move on.
                log::warn!("failed to update summary for {}: {}", name, failure);
                state.log.append(
                    round,
                    EventType::SystemBroadcast,
                    None,
                    None,
                    json!({
                        "code": "summary_refresh_failed",
                        "agent": name,
                        "summary": format!("summary refresh failed for {}", name),
                    }),
                );
            }
        }
    }
}
