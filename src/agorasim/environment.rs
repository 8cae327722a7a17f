//! LM-assisted environment events.
//!
//! At turn-interval milestones a branch can surface researcher-facing
//! suggestions for environmental interventions (weather, emergencies,
//! notifications, public opinion). [`suggest_events`] asks an LM for a
//! handful of suggestions grounded in the branch's recent history;
//! [`broadcast_event`] applies one, injecting it into every agent's memory
//! and recording an `environment_event` in the log.
//!
//! Applying or dismissing a suggestion acknowledges the current milestone,
//! so the availability flag (see
//! [`BranchState::suggestions_available`](crate::sim_tree::BranchState::suggestions_available))
//! drops until the next interval is reached.

use crate::agent_state::MediaRefs;
use crate::client_wrapper::{ChatOptions, LlmClient, Message, Role};
use crate::config::KernelConfig;
use crate::error::SimError;
use crate::event_log::EventType;
use crate::sim_tree::BranchState;
use crate::turn::format_time_prefix;
use crate::validator::{strip_markdown_fences, strip_think_tags};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Kind of environmental intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    Weather,
    Emergency,
    Notification,
    Opinion,
}

impl EnvironmentKind {
    /// The bracketed prefix agents see in their memory.
    pub fn prefix(&self) -> &'static str {
        match self {
            EnvironmentKind::Weather => "WEATHER",
            EnvironmentKind::Emergency => "EMERGENCY",
            EnvironmentKind::Notification => "NOTIFICATION",
            EnvironmentKind::Opinion => "PUBLIC OPINION",
        }
    }
}

/// How disruptive an environment event is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Mild,
    Moderate,
    Severe,
}

impl Default for EventSeverity {
    fn default() -> Self {
        EventSeverity::Mild
    }
}

/// One suggested (or applied) environmental event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSuggestion {
    pub event_type: EnvironmentKind,
    pub description: String,
    #[serde(default)]
    pub severity: EventSeverity,
}

impl EnvironmentSuggestion {
    /// Render the line agents receive, e.g. `"[18:09] [WEATHER] Heavy rain
    /// begins to fall."`
    pub fn render(&self, clock_minutes: u32) -> String {
        format!(
            "{}[{}] {}",
            format_time_prefix(clock_minutes),
            self.event_type.prefix(),
            self.description
        )
    }
}

fn build_suggestion_prompt(state: &BranchState, count: usize) -> String {
    let recent: Vec<String> = state
        .log
        .entries()
        .iter()
        .rev()
        .take(10)
        .filter_map(|e| e.payload.get("summary").and_then(|s| s.as_str()))
        .map(|s| format!("- {}", s))
        .collect();
    let recent_text = if recent.is_empty() {
        "- (nothing has happened yet)".to_string()
    } else {
        recent.into_iter().rev().collect::<Vec<_>>().join("\n")
    };

    format!(
        "You design environmental interventions for a social simulation.\n\n\
         Scenario: {}\n\
         Agents: {}\n\
         Completed rounds: {}\n\
         Recent events:\n{}\n\n\
         Suggest {} environmental events that would plausibly perturb this \
         situation. Each event has an event_type (one of \"weather\", \
         \"emergency\", \"notification\", \"opinion\"), a one-sentence \
         description, and a severity (\"mild\", \"moderate\", \"severe\").\n\
         Respond ONLY with a JSON array of objects with keys event_type, \
         description, severity.",
        state.scenario.name,
        state.agent_order.len(),
        state.turns_completed,
        recent_text,
        count,
    )
}

/// Ask the LM for up to `count` environment-event suggestions grounded in
/// the branch's recent history.
///
/// Transport or parse failure surfaces as [`SimError::LlmCall`]; suggestions
/// the model got structurally wrong are dropped rather than repaired.
pub async fn suggest_events(
    state: &BranchState,
    client: Arc<dyn LlmClient>,
    config: &KernelConfig,
    count: usize,
) -> Result<Vec<EnvironmentSuggestion>, SimError> {
    let count = count.min(config.max_suggestions).max(1);
    let prompt = build_suggestion_prompt(state, count);
    let options = ChatOptions {
        json_mode: true,
        schema: None,
        max_tokens: None,
        deadline: Some(config.llm_call_timeout),
    };

    let raw = client
        .chat(&[Message::new(Role::User, prompt)], &options)
        .await
        .map_err(|e| SimError::LlmCall(e.to_string()))?;

    let cleaned = strip_think_tags(strip_markdown_fences(&raw));
    let parsed: serde_json::Value = serde_json::from_str(&cleaned)
        .map_err(|e| SimError::LlmCall(format!("unparseable suggestion payload: {}", e)))?;

    // Accept either a bare array or an object wrapping one.
    let items = match &parsed {
        serde_json::Value::Array(items) => items.clone(),
        serde_json::Value::Object(map) => map
            .get("suggestions")
            .or_else(|| map.get("events"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    let suggestions: Vec<EnvironmentSuggestion> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .filter(|s: &EnvironmentSuggestion| !s.description.trim().is_empty())
        .take(count)
        .collect();

    if suggestions.is_empty() {
        return Err(SimError::LlmCall(
            "LM returned no usable environment suggestions".into(),
        ));
    }

    log::info!("generated {} environment suggestions", suggestions.len());
    Ok(suggestions)
}

/// Apply an environment event to a branch: every agent receives the rendered
/// line as environment feedback, the log records an `environment_event`, and
/// the current suggestion milestone is acknowledged.
pub fn broadcast_event(
    state: &mut BranchState,
    suggestion: &EnvironmentSuggestion,
    config: &KernelConfig,
) {
    let formatted = suggestion.render(state.clock_minutes());

    let order = state.agent_order.clone();
    for name in &order {
        if let Some(agent) = state.agents.get_mut(name) {
            agent.inject_env_feedback(formatted.clone(), MediaRefs::default());
        }
    }

    state.log.append(
        state.turns_completed,
        EventType::EnvironmentEvent,
        None,
        Some(order),
        json!({
            "event_type": suggestion.event_type,
            "description": suggestion.description,
            "severity": suggestion.severity,
            "summary": formatted,
        }),
    );

    state.mark_suggestions_viewed(config.suggestion_interval);
}
