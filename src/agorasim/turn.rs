//! One agent's decision cycle: prompt → constrained decode → validate →
//! execute → record.
//!
//! The pipeline is split in two phases so the round runner can honour the
//! ordering rule for simultaneous rounds (decide in parallel, record in
//! declared order):
//!
//! - [`decide_turn`] composes the 5-section prompt, calls the LM through the
//!   bounded pool (with per-call deadline, retry, backoff, and
//!   cancellation), validates the response, and, for freeform grammars
//!   missing required parameters, spends the single re-prompt of the turn's
//!   budget. It never mutates anything.
//! - [`record_turn`] appends the `agent_action` event, mutates the agent's
//!   memory on success, advances the scene clock, and runs the mechanics'
//!   side effects (including topology-filtered broadcasts).
//!
//! A skipped turn is recorded as an event but leaves the agent's properties
//! and short memory untouched; it never poisons the branch.

use crate::agent_state::{AgentState, MediaRefs, MemoryRole};
use crate::client_wrapper::{ChatOptions, LlmClient, Message, Role};
use crate::config::KernelConfig;
use crate::event_log::{EventLog, EventType};
use crate::lm_pool::{CallFailure, CancelToken, LmPool};
use crate::mechanics::{self, MechanicOutcome};
use crate::prompt::{build_prompt, build_reprompt, EventView};
use crate::scenario::{build_schema, ScenarioSpec};
use crate::sim_tree::BranchState;
use crate::validator::{validate, SkipReason, Validation};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of one agent turn. Always one of ok or skip.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// The validated values map, output field normalised.
    Ok {
        values: serde_json::Map<String, serde_json::Value>,
    },
    /// The turn did not produce a usable action.
    Skip { reason: SkipReason },
}

impl ActionOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ActionOutcome::Ok { .. })
    }

    /// One-line human-readable summary, e.g. `"Alice chose defect"`.
    pub fn summary(&self, agent: &str, output_field: &str) -> String {
        match self {
            ActionOutcome::Ok { values } => {
                let value = values
                    .get(output_field)
                    .map(render_value)
                    .unwrap_or_else(|| "nothing".to_string());
                format!("{} chose {}", agent, value)
            }
            ActionOutcome::Skip { reason } => format!("{} skipped ({})", agent, reason),
        }
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `[H:MM] ` prefix used on memory feedback lines.
pub fn format_time_prefix(clock_minutes: u32) -> String {
    format!("[{}:{:02}] ", clock_minutes / 60, clock_minutes % 60)
}

/// Decide phase: prompt the LM and validate its answer. Read-only with
/// respect to branch state.
///
/// The re-prompting budget is strictly one additional call per turn: a
/// freeform response still missing required parameters after the retry is a
/// skip with reason `missing_parameters`.
pub async fn decide_turn(
    agent: &AgentState,
    scenario: &ScenarioSpec,
    view: &EventView,
    client: Arc<dyn LlmClient>,
    pool: &LmPool,
    config: &KernelConfig,
    cancel: CancelToken,
) -> ActionOutcome {
    let options = ChatOptions {
        json_mode: true,
        schema: Some(build_schema(&scenario.grammar)),
        max_tokens: None,
        deadline: Some(config.llm_call_timeout),
    };

    let mut messages = agent.render_context(scenario);
    messages.push(Message::new(Role::User, build_prompt(agent, scenario, view)));

    let raw = match pool
        .call_with_retry(
            client.clone(),
            messages,
            options.clone(),
            config.llm_attempts,
            config.backoff_base,
            cancel.clone(),
        )
        .await
    {
        Ok(text) => text,
        Err(failure) => return skip_for_failure(agent, failure),
    };

    match validate(&raw, &scenario.grammar) {
        Validation::Ok(values) => ActionOutcome::Ok { values },
        Validation::Skip { reason } => {
            log::debug!("{}: turn skipped ({})", agent.name, reason);
            ActionOutcome::Skip { reason }
        }
        Validation::Retry { missing, values } => {
            let chosen = values
                .get(scenario.grammar.output_field())
                .and_then(|v| v.as_str())
                .unwrap_or("act")
                .to_string();

            let mut retry_messages = agent.render_context(scenario);
            retry_messages.push(Message::new(
                Role::User,
                build_reprompt(agent, scenario, view, &chosen, &missing),
            ));

            let raw = match pool
                .call_with_retry(
                    client,
                    retry_messages,
                    options,
                    config.llm_attempts,
                    config.backoff_base,
                    cancel,
                )
                .await
            {
                Ok(text) => text,
                Err(failure) => return skip_for_failure(agent, failure),
            };

            match validate(&raw, &scenario.grammar) {
                Validation::Ok(values) => ActionOutcome::Ok { values },
                // Second missing-parameter outcome: the budget is spent.
                Validation::Retry { .. } => ActionOutcome::Skip {
                    reason: SkipReason::MissingParameters,
                },
                Validation::Skip { reason } => ActionOutcome::Skip { reason },
            }
        }
    }
}

fn skip_for_failure(agent: &AgentState, failure: CallFailure) -> ActionOutcome {
    match failure {
        CallFailure::Cancelled => ActionOutcome::Skip {
            reason: SkipReason::Cancelled,
        },
        CallFailure::Unavailable(msg) => {
            log::warn!("{}: LM unavailable, skipping turn: {}", agent.name, msg);
            ActionOutcome::Skip {
                reason: SkipReason::LlmUnavailable,
            }
        }
    }
}

/// Record phase: append the `agent_action` event, mutate memory, advance the
/// clock, and run mechanic side effects.
pub fn record_turn(state: &mut BranchState, actor: &str, outcome: &ActionOutcome, round: u32) {
    let output_field = state.scenario.grammar.output_field().to_string();
    let summary = outcome.summary(actor, &output_field);
    let clock = state.clock_minutes();

    match outcome {
        ActionOutcome::Ok { values } => {
            state.log.append(
                round,
                EventType::AgentAction,
                Some(actor.to_string()),
                None,
                json!({
                    "summary": summary,
                    "values": values,
                    "time": clock,
                }),
            );

            if let Some(agent) = state.agents.get_mut(actor) {
                agent.append_memory(
                    MemoryRole::Assistant,
                    format!("{}{}", format_time_prefix(clock), summary),
                    MediaRefs::default(),
                );
            }

            // Post-turn hooks: scene clock, then mechanics in declaration
            // order.
            let minutes = state.scenario.minutes_per_turn;
            state.advance_clock(minutes);

            let BranchState {
                scenario,
                agents,
                agent_order,
                scene_state,
                log,
                ..
            } = state;
            let outcomes =
                mechanics::apply_post_turn(scenario, actor, values, agents, scene_state, round);
            let clock = scene_state
                .get("time")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32;
            for effect in outcomes {
                match effect {
                    MechanicOutcome::Note {
                        mechanic,
                        summary,
                        payload,
                    } => {
                        log.append(
                            round,
                            EventType::EnvironmentEvent,
                            Some(actor.to_string()),
                            None,
                            json!({
                                "mechanic": mechanic,
                                "summary": summary,
                                "detail": payload,
                                "time": clock,
                            }),
                        );
                    }
                    MechanicOutcome::Broadcast { message } => {
                        broadcast_chat(
                            scenario,
                            agents,
                            agent_order,
                            log,
                            clock,
                            round,
                            actor,
                            &message,
                        );
                    }
                }
            }
        }
        ActionOutcome::Skip { reason } => {
            state.log.append(
                round,
                EventType::AgentAction,
                Some(actor.to_string()),
                None,
                json!({
                    "summary": summary,
                    "error": reason.as_str(),
                    "time": clock,
                }),
            );
            // The agent itself stays untouched; only the clock moves on.
            let minutes = state.scenario.minutes_per_turn;
            state.advance_clock(minutes);
        }
    }
}

/// Deliver a chat message from `sender`, filtered by the scenario's network
/// topology when present: effective recipients are
/// `adjacency[sender] ∩ agents_in_scene`. Absent topology implies full
/// broadcast.
///
/// With a topology configured the log records a `system_broadcast` audit
/// event; its `recipients` field is written from the same set used for the
/// memory injections, so the two always agree.
pub fn broadcast_chat(
    scenario: &ScenarioSpec,
    agents: &mut HashMap<String, AgentState>,
    agent_order: &[String],
    log: &mut EventLog,
    clock_minutes: u32,
    round: u32,
    sender: &str,
    message: &str,
) {
    let names: Vec<String> = agent_order.to_vec();
    let recipients = scenario.recipients_for(sender, &names);

    let formatted = format!("{}{}: {}", format_time_prefix(clock_minutes), sender, message);

    // The sender retains what they said in their own context.
    if let Some(agent) = agents.get_mut(sender) {
        agent.inject_env_feedback(formatted.clone(), MediaRefs::default());
    }
    for name in &recipients {
        if let Some(agent) = agents.get_mut(name) {
            agent.inject_env_feedback(formatted.clone(), MediaRefs::default());
        }
    }

    let kind = if scenario.network_topology.is_some() {
        EventType::SystemBroadcast
    } else {
        EventType::Chat
    };

    log.append(
        round,
        kind,
        Some(sender.to_string()),
        Some(recipients.clone()),
        json!({
            "summary": format!("{}: {}", sender, message),
            "message": message,
            "recipients": recipients,
            "time": clock_minutes,
        }),
    );
}
