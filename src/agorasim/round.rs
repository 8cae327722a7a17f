//! Round execution under a visibility policy.
//!
//! A round is one pass through all agents' turns. Two modes:
//!
//! - **Simultaneous**: every agent's prompt is composed from the same
//!   rolling-context snapshot taken at the round's start; the LM calls fan
//!   out in parallel through the bounded pool. Recorded events follow the
//!   declared agent order regardless of completion order, and no agent sees
//!   another's action within the round.
//! - **Sequential**: agents act one at a time in declared order. Each
//!   prompt observes the prior agents' events from the same round through a
//!   live [`EventView`]; the rolling summaries are untouched mid-round.
//!
//! A round is complete when every agent has produced an ok or skip outcome;
//! the runner then invokes the context summariser exactly once per agent.
//! Cancellation mid-round aborts pending LM calls, keeps the events of
//! agents that already recorded, marks the round aborted in the log, and
//! reports [`RoundOutcome::Aborted`] so the tree returns the node to idle.

use crate::client_wrapper::LlmBindings;
use crate::config::KernelConfig;
use crate::error::SimError;
use crate::event_log::EventType;
use crate::lm_pool::{CancelToken, LmPool};
use crate::observer::SimObserver;
use crate::prompt::EventView;
use crate::scenario::Visibility;
use crate::sim_tree::BranchState;
use crate::summarizer;
use crate::turn::{decide_turn, record_turn, ActionOutcome};
use crate::validator::SkipReason;
use serde_json::json;
use std::sync::Arc;

/// How a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Every agent produced ok or skip; summaries were refreshed.
    Completed,
    /// Cancellation interrupted the round; partial events were kept.
    Aborted,
}

/// Execute one round against the branch state. Called by
/// [`SimulationTree::run`](crate::sim_tree::SimulationTree::run), which owns
/// the single-writer lock.
pub async fn run_round(
    state: &mut BranchState,
    node_id: u64,
    round: u32,
    bindings: &LlmBindings,
    config: &KernelConfig,
    observer: Arc<dyn SimObserver>,
    cancel: CancelToken,
) -> Result<RoundOutcome, SimError> {
    log::info!("node {}: starting round {}", node_id, round);

    let pool = LmPool::for_round(state.agent_order.len(), config.worker_cap);

    let outcome = match state.scenario.visibility {
        Visibility::Simultaneous => {
            run_simultaneous(state, node_id, round, bindings, config, &pool, &observer, &cancel)
                .await?
        }
        Visibility::Sequential => {
            run_sequential(state, node_id, round, bindings, config, &pool, &observer, &cancel)
                .await?
        }
    };

    if outcome == RoundOutcome::Aborted {
        append_abort_marker(state, round);
        log::warn!("node {}: round {} aborted", node_id, round);
        return Ok(outcome);
    }

    // Update context summaries after the round.
    summarizer::update_summaries(state, bindings, &pool, config, round, cancel).await;

    log::info!(
        "node {}: round {} complete ({} agents)",
        node_id,
        round,
        state.agent_order.len()
    );
    Ok(RoundOutcome::Completed)
}

fn append_abort_marker(state: &mut BranchState, round: u32) {
    state.log.append(
        round,
        EventType::SystemBroadcast,
        None,
        None,
        json!({
            "code": "round_aborted",
            "round": round,
            "summary": format!("round {} aborted", round),
        }),
    );
}

fn resolve_client(
    bindings: &LlmBindings,
    state: &BranchState,
    name: &str,
) -> Result<Arc<dyn crate::client_wrapper::LlmClient>, SimError> {
    let binding = state
        .agents
        .get(name)
        .map(|a| a.llm_binding.clone())
        .unwrap_or_else(|| "default".to_string());
    bindings
        .resolve(&binding)
        .ok_or_else(|| SimError::Config(format!("no LM client bound for '{}'", binding)))
}

/// All agents decide from the same pre-round snapshot, in parallel; events
/// are recorded in declared order afterwards.
async fn run_simultaneous(
    state: &mut BranchState,
    node_id: u64,
    round: u32,
    bindings: &LlmBindings,
    config: &KernelConfig,
    pool: &LmPool,
    observer: &Arc<dyn SimObserver>,
    cancel: &CancelToken,
) -> Result<RoundOutcome, SimError> {
    let order = state.agent_order.clone();

    // Spawn one decide task per agent, each over a clone of the pre-round
    // snapshot. No task sees any same-round event.
    let mut tasks = Vec::with_capacity(order.len());
    for (index, name) in order.iter().enumerate() {
        let agent = match state.agents.get(name) {
            Some(agent) => agent.clone(),
            None => {
                return Err(SimError::System(format!(
                    "agent '{}' missing from branch state",
                    name
                )))
            }
        };
        let scenario = state.scenario.clone();
        let client = resolve_client(bindings, state, name)?;
        let pool = pool.clone();
        let config = config.clone();
        let cancel = cancel.clone();

        tasks.push(tokio::spawn(async move {
            let view = EventView::pre_round();
            let outcome =
                decide_turn(&agent, &scenario, &view, client, &pool, &config, cancel).await;
            (index, outcome)
        }));
    }

    let mut outcomes: Vec<Option<ActionOutcome>> = vec![None; order.len()];
    for task in tasks {
        match task.await {
            Ok((index, outcome)) => outcomes[index] = Some(outcome),
            Err(err) => {
                return Err(SimError::System(format!("turn task panicked: {}", err)));
            }
        }
    }

    // Record in declared order regardless of completion order. Cancelled
    // turns are not recorded; they mark the round aborted instead.
    let mut aborted = false;
    for (name, outcome) in order.iter().zip(outcomes.into_iter()) {
        let outcome = match outcome {
            Some(outcome) => outcome,
            None => continue,
        };
        if matches!(
            outcome,
            ActionOutcome::Skip {
                reason: SkipReason::Cancelled
            }
        ) {
            aborted = true;
            continue;
        }
        record_turn(state, name, &outcome, round);
        observer.on_agent_acted(node_id, round, name, &outcome).await;
    }

    if aborted || cancel.is_cancelled() {
        return Ok(RoundOutcome::Aborted);
    }
    Ok(RoundOutcome::Completed)
}

/// Agents act one at a time in declared order; each prompt reads the live
/// log for the current round so far.
async fn run_sequential(
    state: &mut BranchState,
    node_id: u64,
    round: u32,
    bindings: &LlmBindings,
    config: &KernelConfig,
    pool: &LmPool,
    observer: &Arc<dyn SimObserver>,
    cancel: &CancelToken,
) -> Result<RoundOutcome, SimError> {
    let order = state.agent_order.clone();

    for name in &order {
        if cancel.is_cancelled() {
            return Ok(RoundOutcome::Aborted);
        }

        let agent = match state.agents.get(name) {
            Some(agent) => agent.clone(),
            None => {
                return Err(SimError::System(format!(
                    "agent '{}' missing from branch state",
                    name
                )))
            }
        };
        let client = resolve_client(bindings, state, name)?;
        let view = EventView::live(&state.log, round);

        let outcome = decide_turn(
            &agent,
            &state.scenario,
            &view,
            client,
            pool,
            config,
            cancel.clone(),
        )
        .await;

        if matches!(
            outcome,
            ActionOutcome::Skip {
                reason: SkipReason::Cancelled
            }
        ) {
            return Ok(RoundOutcome::Aborted);
        }

        // Recording immediately makes this action visible to the next
        // agent's live view.
        record_turn(state, name, &outcome, round);
        observer.on_agent_acted(node_id, round, name, &outcome).await;
    }

    Ok(RoundOutcome::Completed)
}
