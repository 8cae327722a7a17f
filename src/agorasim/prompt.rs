//! Prompt construction for agent turns.
//!
//! Every turn prompt has five fixed sections, in this order:
//!
//! 1. an identity paragraph derived from the agent's properties, with
//!    numeric traits bucketised into low/moderate/high at the 33/66
//!    boundaries;
//! 2. the scenario description;
//! 3. the available actions, rendered per grammar type;
//! 4. the agent's rolling summary (or an explicit first-round note), plus
//!    whatever the [`EventView`] exposes of the current round;
//! 5. an instruction to respond strictly as a JSON object with the exact
//!    output field name embedded.
//!
//! Round visibility is *not* decided here. The round runner hands the
//! builder an [`EventView`] that is either a pre-round snapshot (empty in
//! simultaneous mode) or a live view of the current round so far (sequential
//! mode); the builder renders whatever it is given.

use crate::agent_state::AgentState;
use crate::event_log::{EventEntry, EventLog, EventType};
use crate::scenario::{ActionGrammar, ScenarioSpec};

/// What an agent may see of the current round while composing its turn.
///
/// Constructed by the round runner: [`EventView::pre_round`] for
/// simultaneous visibility, [`EventView::live`] for sequential visibility.
#[derive(Debug, Clone, Default)]
pub struct EventView {
    lines: Vec<String>,
}

impl EventView {
    /// The pre-round snapshot: no same-round events are visible.
    pub fn pre_round() -> Self {
        Self::default()
    }

    /// A live view over the events the current round has produced so far.
    pub fn live(log: &EventLog, round: u32) -> Self {
        Self {
            lines: log
                .round_entries(round)
                .into_iter()
                .map(render_event_line)
                .collect(),
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// One human-readable line for an event, preferring the summary the
/// recorder attached to the payload.
fn render_event_line(entry: &EventEntry) -> String {
    if let Some(summary) = entry.payload.get("summary").and_then(|s| s.as_str()) {
        return summary.to_string();
    }
    match entry.kind {
        EventType::AgentAction => {
            let sender = entry.sender.as_deref().unwrap_or("someone");
            match entry.payload.get("error") {
                Some(_) => format!("{} did not act", sender),
                None => format!("{} acted", sender),
            }
        }
        EventType::Chat => {
            let sender = entry.sender.as_deref().unwrap_or("someone");
            let message = entry
                .payload
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("");
            format!("{}: {}", sender, message)
        }
        other => format!("[{}]", other.as_str()),
    }
}

/// Convert a numeric score to its interpretation bracket:
/// 0–33 low, 34–66 moderate, 67+ high.
pub fn interpret_score(value: i64) -> &'static str {
    if value <= 33 {
        "low"
    } else if value <= 66 {
        "moderate"
    } else {
        "high"
    }
}

fn article_for(word: &str) -> &'static str {
    match word.chars().next().map(|c| c.to_ascii_lowercase()) {
        Some('a') | Some('e') | Some('i') | Some('o') | Some('u') => "an",
        _ => "a",
    }
}

/// Build the identity paragraph from demographic properties.
///
/// Numeric traits are rendered with interpretation brackets, e.g.
/// `"Your social_capital score is 82/100 (high)."`
pub fn build_agent_description(agent: &AgentState) -> String {
    let mut parts = Vec::new();

    let age_group = agent
        .properties
        .get("age_group")
        .and_then(|v| v.as_str())
        .unwrap_or("adult");
    let profession = agent
        .properties
        .get("profession")
        .and_then(|v| v.as_str())
        .unwrap_or("person");
    parts.push(format!(
        "You are {} {} {}.",
        article_for(age_group),
        age_group,
        profession
    ));

    for (key, value) in &agent.properties {
        if key == "age_group" || key == "profession" {
            continue;
        }
        if let Some(number) = value.as_i64() {
            parts.push(format!(
                "Your {} score is {}/100 ({}).",
                key,
                number,
                interpret_score(number)
            ));
        } else if let Some(number) = value.as_f64() {
            parts.push(format!(
                "Your {} score is {}/100 ({}).",
                key,
                number,
                interpret_score(number as i64)
            ));
        } else if let Some(text) = value.as_str() {
            parts.push(format!("Your {} is {}.", key, text));
        }
    }

    parts.join(" ")
}

fn render_actions_section(grammar: &ActionGrammar) -> String {
    match grammar {
        ActionGrammar::Discrete { actions, .. } => {
            let list = actions
                .iter()
                .map(|a| format!("- {}", a))
                .collect::<Vec<_>>()
                .join("\n");
            format!("\n## Available Actions\n{}", list)
        }
        ActionGrammar::Integer { min, max, .. } => format!(
            "\n## Your Action\nChoose a value from {} to {}.",
            min, max
        ),
        ActionGrammar::Freeform { params, .. } => {
            let list = params
                .iter()
                .map(|p| {
                    if p.required {
                        format!("- {} (required): {}", p.name, p.description)
                    } else {
                        format!("- {}: {}", p.name, p.description)
                    }
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!("\n## Action Parameters\n{}", list)
        }
    }
}

fn render_format_section(grammar: &ActionGrammar) -> String {
    match grammar {
        ActionGrammar::Discrete {
            output_field,
            actions,
        } => {
            let options = actions
                .iter()
                .map(|a| format!("\"{}\"", a))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "\n## Your Response\nRespond ONLY with valid JSON: {{\"reasoning\": \"one sentence\", \"{}\": <{}>}}",
                output_field, options
            )
        }
        ActionGrammar::Integer {
            output_field,
            min,
            max,
        } => format!(
            "\n## Your Response\nRespond ONLY with valid JSON: {{\"reasoning\": \"one sentence\", \"{}\": <integer from {}-{}>}}",
            output_field, min, max
        ),
        ActionGrammar::Freeform {
            output_field,
            params,
        } => {
            let fields = params
                .iter()
                .map(|p| format!("\"{}\": <{}>", p.name, p.description))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "\n## Your Response\nRespond ONLY with valid JSON: {{\"reasoning\": \"one sentence\", \"{}\": \"<action>\", {}}}",
                output_field, fields
            )
        }
    }
}

/// Build the 5-section structured prompt for one agent turn.
pub fn build_prompt(agent: &AgentState, scenario: &ScenarioSpec, view: &EventView) -> String {
    let mut sections = Vec::new();

    // Section 1: identity
    sections.push(build_agent_description(agent));

    // Section 2: scenario
    sections.push(format!("\n## Scenario\n{}", scenario.description));

    // Section 3: available actions
    sections.push(render_actions_section(&scenario.grammar));

    // Section 4: context
    let mut context = String::from("\n## Context\n");
    if agent.rolling_summary.is_empty() {
        context.push_str("This is the first round - no previous context.");
    } else {
        context.push_str(&agent.rolling_summary);
    }
    if !view.is_empty() {
        context.push_str("\nEarlier this round:");
        for line in view.lines() {
            context.push_str(&format!("\n- {}", line));
        }
    }
    sections.push(context);

    // Section 5: output format
    sections.push(render_format_section(&scenario.grammar));
    sections.push("\nNo markdown. No explanation. Only JSON.".to_string());

    sections.join("\n")
}

/// Build the re-prompt for a freeform response that was missing required
/// parameters. Restates only the missing parameters.
pub fn build_reprompt(
    agent: &AgentState,
    scenario: &ScenarioSpec,
    view: &EventView,
    chosen_action: &str,
    missing: &[String],
) -> String {
    let base = build_prompt(agent, scenario, view);

    let params = match &scenario.grammar {
        ActionGrammar::Freeform { params, .. } => params
            .iter()
            .filter(|p| missing.iter().any(|m| m == &p.name))
            .map(|p| format!("\"{}\": <{}>", p.name, p.description))
            .collect::<Vec<_>>()
            .join(", "),
        _ => missing
            .iter()
            .map(|m| format!("\"{}\": <value>", m))
            .collect::<Vec<_>>()
            .join(", "),
    };

    format!(
        "{}\n\nYou chose to {}. This action still needs: {}.\nRespond ONLY with valid JSON: {{\"{}\": \"{}\", {}}}",
        base,
        chosen_action,
        missing.join(", "),
        scenario.grammar.output_field(),
        chosen_action,
        params
    )
}
