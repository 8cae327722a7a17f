//! Runtime side effects for scenario mechanics.
//!
//! A mechanic is a modular interaction pattern layered on top of the action
//! grammar: grid worlds, proposal voting, resource inventories, role
//! hierarchies, and free discussion. Each is configured declaratively on the
//! [`ScenarioSpec`](crate::scenario::ScenarioSpec) via
//! [`MechanicConfig`](crate::scenario::MechanicConfig); this module holds the
//! runtime half:
//!
//! - [`initialize_agents`] seeds agent properties (grid coordinates,
//!   starting inventories, hierarchy ranks) when a simulation is created.
//! - [`apply_post_turn`] runs after every recorded action, in mechanic
//!   declaration order, reading the validated values map and mutating agent
//!   properties and scene state.
//!
//! Mechanic state lives in agent properties and the branch's `scene_state`
//! map (never in the mechanic itself), so forked branches inherit it through
//! the ordinary deep copy.

use crate::agent_state::AgentState;
use crate::scenario::{MechanicConfig, ScenarioSpec};
use serde_json::{json, Value};
use std::collections::HashMap;

/// What a mechanic wants done after a turn.
#[derive(Debug, Clone)]
pub enum MechanicOutcome {
    /// Record an `environment_event` with this payload.
    Note {
        mechanic: &'static str,
        summary: String,
        payload: Value,
    },
    /// Deliver a chat message from the actor through the scenario's
    /// broadcast path (topology-filtered by the turn pipeline).
    Broadcast { message: String },
}

/// Seed agent properties required by the scenario's mechanics.
///
/// Called once when a root simulation is created. Forked branches inherit
/// the parent's (possibly patched) properties instead.
pub fn initialize_agents(
    scenario: &ScenarioSpec,
    agents: &mut HashMap<String, AgentState>,
    agent_order: &[String],
) {
    for mechanic in &scenario.mechanics {
        match mechanic {
            MechanicConfig::Grid { width, height } => {
                // Row-major placement so initial positions are deterministic.
                for (i, name) in agent_order.iter().enumerate() {
                    if let Some(agent) = agents.get_mut(name) {
                        let x = (i as i64) % width;
                        let y = ((i as i64) / width) % height;
                        agent.properties.entry("pos_x".to_string()).or_insert(json!(x));
                        agent.properties.entry("pos_y".to_string()).or_insert(json!(y));
                    }
                }
            }
            MechanicConfig::Resources { initial } => {
                for name in agent_order {
                    if let Some(agent) = agents.get_mut(name) {
                        let inventory = agent
                            .properties
                            .entry("resources".to_string())
                            .or_insert_with(|| json!({}));
                        if let Value::Object(map) = inventory {
                            for (resource, amount) in initial {
                                map.entry(resource.clone()).or_insert(json!(amount));
                            }
                        }
                    }
                }
            }
            MechanicConfig::Hierarchy { levels } => {
                for name in agent_order {
                    if let Some(agent) = agents.get_mut(name) {
                        let role = agent
                            .properties
                            .get("role")
                            .and_then(|r| r.as_str())
                            .unwrap_or("")
                            .to_lowercase();
                        let rank = levels
                            .iter()
                            .position(|level| level.to_lowercase() == role)
                            .unwrap_or(levels.len().saturating_sub(1));
                        agent.properties.insert("rank".to_string(), json!(rank));
                    }
                }
            }
            MechanicConfig::Voting { .. } | MechanicConfig::Discussion { .. } => {}
        }
    }
}

/// Run all mechanics for one recorded action, in declaration order.
///
/// `values` is the validated values map produced by the
/// [validator](crate::validator); mechanics look up their parameters in it
/// by convention (`direction`, `proposal`, `vote`, `recipient`, `amount`,
/// `message`).
pub fn apply_post_turn(
    scenario: &ScenarioSpec,
    actor: &str,
    values: &serde_json::Map<String, Value>,
    agents: &mut HashMap<String, AgentState>,
    scene_state: &mut serde_json::Map<String, Value>,
    turn: u32,
) -> Vec<MechanicOutcome> {
    let mut outcomes = Vec::new();
    for mechanic in &scenario.mechanics {
        match mechanic {
            MechanicConfig::Grid { width, height } => {
                apply_grid(*width, *height, actor, values, agents, &mut outcomes);
            }
            MechanicConfig::Voting {
                threshold,
                timeout_turns,
                allow_abstain,
            } => {
                apply_voting(
                    *threshold,
                    *timeout_turns,
                    *allow_abstain,
                    actor,
                    values,
                    scene_state,
                    turn,
                    &mut outcomes,
                );
            }
            MechanicConfig::Resources { .. } => {
                apply_resources(actor, values, agents, &mut outcomes);
            }
            MechanicConfig::Hierarchy { levels } => {
                apply_hierarchy(levels, actor, values, agents, &mut outcomes);
            }
            MechanicConfig::Discussion {
                max_messages_per_turn,
            } => {
                apply_discussion(
                    *max_messages_per_turn,
                    actor,
                    values,
                    scene_state,
                    turn,
                    &mut outcomes,
                );
            }
        }
    }
    outcomes
}

fn value_str<'a>(values: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    values.get(key).and_then(|v| v.as_str())
}

// ── Grid ────────────────────────────────────────────────────────────────

fn apply_grid(
    width: i64,
    height: i64,
    actor: &str,
    values: &serde_json::Map<String, Value>,
    agents: &mut HashMap<String, AgentState>,
    outcomes: &mut Vec<MechanicOutcome>,
) {
    // Accept either a dedicated `direction` parameter or a `move_<dir>`
    // discrete action.
    let direction = value_str(values, "direction")
        .map(|d| d.to_lowercase())
        .or_else(|| {
            values
                .values()
                .filter_map(|v| v.as_str())
                .find(|v| v.starts_with("move_"))
                .map(|v| v.trim_start_matches("move_").to_lowercase())
        });

    let direction = match direction {
        Some(d) => d,
        None => return,
    };

    let (dx, dy) = match direction.as_str() {
        "north" | "up" => (0, -1),
        "south" | "down" => (0, 1),
        "east" | "right" => (1, 0),
        "west" | "left" => (-1, 0),
        _ => return,
    };

    if let Some(agent) = agents.get_mut(actor) {
        let x = agent
            .properties
            .get("pos_x")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let y = agent
            .properties
            .get("pos_y")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        // Movement clamps at the edges rather than wrapping.
        let nx = (x + dx).max(0).min(width - 1);
        let ny = (y + dy).max(0).min(height - 1);
        agent.properties.insert("pos_x".to_string(), json!(nx));
        agent.properties.insert("pos_y".to_string(), json!(ny));

        outcomes.push(MechanicOutcome::Note {
            mechanic: "grid",
            summary: format!("{} moved {} to ({}, {})", actor, direction, nx, ny),
            payload: json!({
                "code": "grid_move",
                "agent": actor,
                "direction": direction,
                "x": nx,
                "y": ny,
            }),
        });
    }
}

// ── Voting ──────────────────────────────────────────────────────────────

fn apply_voting(
    threshold: f64,
    timeout_turns: u32,
    allow_abstain: bool,
    actor: &str,
    values: &serde_json::Map<String, Value>,
    scene_state: &mut serde_json::Map<String, Value>,
    turn: u32,
    outcomes: &mut Vec<MechanicOutcome>,
) {
    let proposals = scene_state
        .entry("proposals".to_string())
        .or_insert_with(|| json!({}));
    let proposals = match proposals.as_object_mut() {
        Some(map) => map,
        None => return,
    };

    // Expire stale proposals first.
    for (_, proposal) in proposals.iter_mut() {
        if let Value::Object(p) = proposal {
            let created = p.get("turn_created").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            let active = p.get("active").and_then(|v| v.as_bool()).unwrap_or(false);
            if active && turn > created + timeout_turns {
                p.insert("active".to_string(), json!(false));
                p.insert("expired".to_string(), json!(true));
            }
        }
    }

    // A `propose` parameter opens a new proposal.
    if let Some(title) = value_str(values, "propose") {
        let title = title.to_string();
        proposals.insert(
            title.clone(),
            json!({
                "proposer": actor,
                "yes": 0,
                "no": 0,
                "abstain": 0,
                "votes_by_agent": {},
                "turn_created": turn,
                "active": true,
            }),
        );
        outcomes.push(MechanicOutcome::Note {
            mechanic: "voting",
            summary: format!("{} proposed '{}'", actor, title),
            payload: json!({"code": "proposal_created", "proposal": title, "proposer": actor}),
        });
        return;
    }

    let (title, choice) = match (value_str(values, "proposal"), value_str(values, "vote")) {
        (Some(t), Some(c)) => (t.to_string(), c.to_lowercase()),
        _ => return,
    };

    if choice == "abstain" && !allow_abstain {
        outcomes.push(MechanicOutcome::Note {
            mechanic: "voting",
            summary: format!("{} tried to abstain on '{}' but abstaining is disabled", actor, title),
            payload: json!({"code": "vote_rejected", "proposal": title, "agent": actor}),
        });
        return;
    }

    let proposal = match proposals.get_mut(&title).and_then(|p| p.as_object_mut()) {
        Some(p) => p,
        None => {
            outcomes.push(MechanicOutcome::Note {
                mechanic: "voting",
                summary: format!("{} voted on unknown proposal '{}'", actor, title),
                payload: json!({"code": "vote_rejected", "proposal": title, "agent": actor}),
            });
            return;
        }
    };

    if !proposal.get("active").and_then(|v| v.as_bool()).unwrap_or(false) {
        outcomes.push(MechanicOutcome::Note {
            mechanic: "voting",
            summary: format!("{} voted on closed proposal '{}'", actor, title),
            payload: json!({"code": "vote_rejected", "proposal": title, "agent": actor}),
        });
        return;
    }

    // Reject unknown choices before touching any tally.
    let tally = match proposal.get(choice.as_str()).and_then(|v| v.as_i64()) {
        Some(count) => count,
        None => {
            outcomes.push(MechanicOutcome::Note {
                mechanic: "voting",
                summary: format!("{} cast invalid vote '{}' on '{}'", actor, choice, title),
                payload: json!({"code": "vote_rejected", "proposal": title, "agent": actor}),
            });
            return;
        }
    };

    // One vote per agent; re-votes replace the previous choice.
    let previous = proposal
        .get("votes_by_agent")
        .and_then(|v| v.get(actor))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if let Some(prev) = &previous {
        if let Some(count) = proposal.get(prev.as_str()).and_then(|v| v.as_i64()) {
            proposal.insert(prev.clone(), json!(count - 1));
        }
    }
    // Re-read in case the previous vote was the same bucket.
    let tally = if previous.as_deref() == Some(choice.as_str()) {
        tally - 1
    } else {
        tally
    };
    proposal.insert(choice.clone(), json!(tally + 1));
    if let Some(by_agent) = proposal
        .get_mut("votes_by_agent")
        .and_then(|v| v.as_object_mut())
    {
        by_agent.insert(actor.to_string(), json!(choice));
    }

    // Strict inequality over the ballots actually cast: abstains and agents
    // who never voted do not count towards the denominator, and a proposal
    // at exactly the threshold has not passed.
    let yes = proposal.get("yes").and_then(|v| v.as_i64()).unwrap_or(0);
    let no = proposal.get("no").and_then(|v| v.as_i64()).unwrap_or(0);
    let total_votes = yes + no;
    let passed = total_votes > 0 && (yes as f64) / (total_votes as f64) > threshold;
    if passed {
        proposal.insert("active".to_string(), json!(false));
        proposal.insert("passed".to_string(), json!(true));
    }

    outcomes.push(MechanicOutcome::Note {
        mechanic: "voting",
        summary: if passed {
            format!("{} voted {} on '{}'; the proposal passed", actor, choice, title)
        } else {
            format!("{} voted {} on '{}'", actor, choice, title)
        },
        payload: json!({
            "code": "vote_cast",
            "proposal": title,
            "agent": actor,
            "vote": choice,
            "passed": passed,
        }),
    });
}

// ── Resources ───────────────────────────────────────────────────────────

fn apply_resources(
    actor: &str,
    values: &serde_json::Map<String, Value>,
    agents: &mut HashMap<String, AgentState>,
    outcomes: &mut Vec<MechanicOutcome>,
) {
    let recipient = match value_str(values, "recipient") {
        Some(r) => r.to_string(),
        None => return,
    };
    let amount = match values.get("amount") {
        Some(v) => v
            .as_i64()
            .unwrap_or_else(|| crate::validator::extract_first_integer(&v.to_string())),
        None => return,
    };
    if amount <= 0 || !agents.contains_key(&recipient) || recipient == actor {
        return;
    }
    let resource = value_str(values, "resource").unwrap_or("tokens").to_string();

    let available = agents
        .get(actor)
        .and_then(|a| a.properties.get("resources"))
        .and_then(|r| r.get(&resource))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    // Transfers are capped at the sender's balance, mirroring the clamp
    // policy for integer grammars.
    let amount = amount.min(available);
    if amount == 0 {
        outcomes.push(MechanicOutcome::Note {
            mechanic: "resources",
            summary: format!("{} has no {} to send to {}", actor, resource, recipient),
            payload: json!({
                "code": "transfer_rejected",
                "from": actor,
                "to": recipient,
                "resource": resource,
            }),
        });
        return;
    }

    adjust_resource(agents, actor, &resource, -amount);
    adjust_resource(agents, &recipient, &resource, amount);

    outcomes.push(MechanicOutcome::Note {
        mechanic: "resources",
        summary: format!("{} sent {} {} to {}", actor, amount, resource, recipient),
        payload: json!({
            "code": "transfer",
            "from": actor,
            "to": recipient,
            "resource": resource,
            "amount": amount,
        }),
    });
}

fn adjust_resource(
    agents: &mut HashMap<String, AgentState>,
    name: &str,
    resource: &str,
    delta: i64,
) {
    if let Some(agent) = agents.get_mut(name) {
        let inventory = agent
            .properties
            .entry("resources".to_string())
            .or_insert_with(|| json!({}));
        if let Value::Object(map) = inventory {
            let current = map.get(resource).and_then(|v| v.as_i64()).unwrap_or(0);
            map.insert(resource.to_string(), json!(current + delta));
        }
    }
}

// ── Hierarchy ───────────────────────────────────────────────────────────

fn apply_hierarchy(
    levels: &[String],
    actor: &str,
    values: &serde_json::Map<String, Value>,
    agents: &mut HashMap<String, AgentState>,
    outcomes: &mut Vec<MechanicOutcome>,
) {
    // Hierarchy annotates directed speech with both ranks so downstream
    // analysis can track cross-rank communication.
    let target = match value_str(values, "recipient") {
        Some(t) => t.to_string(),
        None => return,
    };
    let actor_rank = rank_of(agents, actor);
    let target_rank = match agents.get(&target) {
        Some(_) => rank_of(agents, &target),
        None => return,
    };

    outcomes.push(MechanicOutcome::Note {
        mechanic: "hierarchy",
        summary: format!(
            "{} ({}) addressed {} ({})",
            actor,
            levels.get(actor_rank).map(|s| s.as_str()).unwrap_or("unranked"),
            target,
            levels.get(target_rank).map(|s| s.as_str()).unwrap_or("unranked"),
        ),
        payload: json!({
            "code": "hierarchy_contact",
            "from": actor,
            "from_rank": actor_rank,
            "to": target,
            "to_rank": target_rank,
        }),
    });
}

fn rank_of(agents: &HashMap<String, AgentState>, name: &str) -> usize {
    agents
        .get(name)
        .and_then(|a| a.properties.get("rank"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize
}

// ── Discussion ──────────────────────────────────────────────────────────

fn apply_discussion(
    max_messages_per_turn: u32,
    actor: &str,
    values: &serde_json::Map<String, Value>,
    scene_state: &mut serde_json::Map<String, Value>,
    turn: u32,
    outcomes: &mut Vec<MechanicOutcome>,
) {
    let message = match value_str(values, "message") {
        Some(m) if !m.trim().is_empty() => m.to_string(),
        _ => return,
    };

    // Per-turn send counter, reset whenever the turn number moves on.
    let counter_key = "discussion_sent".to_string();
    let counter = scene_state
        .entry(counter_key)
        .or_insert_with(|| json!({"turn": 0, "counts": {}}));
    if let Value::Object(state) = counter {
        let recorded_turn = state.get("turn").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        if recorded_turn != turn {
            state.insert("turn".to_string(), json!(turn));
            state.insert("counts".to_string(), json!({}));
        }
        if let Some(Value::Object(counts)) = state.get_mut("counts") {
            let sent = counts.get(actor).and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            if sent >= max_messages_per_turn {
                if log::log_enabled!(log::Level::Debug) {
                    log::debug!(
                        "discussion mechanic: {} exceeded {} messages this turn",
                        actor,
                        max_messages_per_turn
                    );
                }
                return;
            }
            counts.insert(actor.to_string(), json!(sent + 1));
        }
    }

    outcomes.push(MechanicOutcome::Broadcast { message });
}
