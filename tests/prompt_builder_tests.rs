use agorasim::agent_state::AgentState;
use agorasim::event_log::{EventLog, EventType};
use agorasim::prompt::{
    build_agent_description, build_prompt, build_reprompt, interpret_score, EventView,
};
use agorasim::scenario::{ActionGrammar, ParamSpec, ScenarioSpec};
use serde_json::json;

fn pd_spec() -> ScenarioSpec {
    ScenarioSpec::builder("pd", "Prisoner's Dilemma")
        .description("Two suspects are arrested and held separately.")
        .grammar(ActionGrammar::discrete("action", &["cooperate", "defect"]))
        .build()
        .unwrap()
}

#[test]
fn test_interpret_score_brackets() {
    assert_eq!(interpret_score(0), "low");
    assert_eq!(interpret_score(33), "low");
    assert_eq!(interpret_score(34), "moderate");
    assert_eq!(interpret_score(66), "moderate");
    assert_eq!(interpret_score(67), "high");
    assert_eq!(interpret_score(100), "high");
}

#[test]
fn test_agent_description_buckets_numeric_traits() {
    let agent = AgentState::new("Alice")
        .with_property("age_group", json!("elderly"))
        .with_property("profession", json!("teacher"))
        .with_property("social_capital", json!(82))
        .with_property("hometown", json!("Riverside"));

    let description = build_agent_description(&agent);
    assert!(description.starts_with("You are an elderly teacher."));
    assert!(description.contains("Your social_capital score is 82/100 (high)."));
    assert!(description.contains("Your hometown is Riverside."));
}

#[test]
fn test_agent_description_picks_article() {
    let agent = AgentState::new("Bob")
        .with_property("age_group", json!("young"))
        .with_property("profession", json!("farmer"));
    assert!(build_agent_description(&agent).starts_with("You are a young farmer."));
}

#[test]
fn test_prompt_has_five_sections_in_order() {
    let agent = AgentState::new("Alice").with_property("profession", json!("analyst"));
    let prompt = build_prompt(&agent, &pd_spec(), &EventView::pre_round());

    let identity = prompt.find("You are").unwrap();
    let scenario = prompt.find("## Scenario").unwrap();
    let actions = prompt.find("## Available Actions").unwrap();
    let context = prompt.find("## Context").unwrap();
    let response = prompt.find("## Your Response").unwrap();

    assert!(identity < scenario);
    assert!(scenario < actions);
    assert!(actions < context);
    assert!(context < response);
    assert!(prompt.contains("No markdown. No explanation. Only JSON."));
}

#[test]
fn test_prompt_embeds_output_field_and_options() {
    let agent = AgentState::new("Alice");
    let prompt = build_prompt(&agent, &pd_spec(), &EventView::pre_round());
    assert!(prompt.contains(r#""action": <"cooperate", "defect">"#));
}

#[test]
fn test_first_round_note_when_summary_empty() {
    let agent = AgentState::new("Alice");
    let prompt = build_prompt(&agent, &pd_spec(), &EventView::pre_round());
    assert!(prompt.contains("This is the first round - no previous context."));
}

#[test]
fn test_rolling_summary_replaces_first_round_note() {
    let mut agent = AgentState::new("Alice");
    agent.rolling_summary = "Bob defected twice in a row.".to_string();
    let prompt = build_prompt(&agent, &pd_spec(), &EventView::pre_round());
    assert!(prompt.contains("Bob defected twice in a row."));
    assert!(!prompt.contains("This is the first round"));
}

#[test]
fn test_integer_grammar_renders_range() {
    let spec = ScenarioSpec::builder("effort", "Minimum Effort")
        .grammar(ActionGrammar::integer("effort", 1, 7))
        .build()
        .unwrap();
    let prompt = build_prompt(&AgentState::new("Alice"), &spec, &EventView::pre_round());
    assert!(prompt.contains("Choose a value from 1 to 7."));
    assert!(prompt.contains(r#""effort": <integer from 1-7>"#));
}

#[test]
fn test_live_view_renders_current_round_section() {
    let mut log = EventLog::new();
    log.append(
        1,
        EventType::AgentAction,
        Some("Alice".to_string()),
        None,
        json!({"summary": "Alice chose cooperate"}),
    );
    let view = EventView::live(&log, 1);

    let prompt = build_prompt(&AgentState::new("Bob"), &pd_spec(), &view);
    assert!(prompt.contains("Earlier this round:"));
    assert!(prompt.contains("- Alice chose cooperate"));
}

#[test]
fn test_pre_round_view_shows_no_round_events() {
    let prompt = build_prompt(&AgentState::new("Bob"), &pd_spec(), &EventView::pre_round());
    assert!(!prompt.contains("Earlier this round:"));
}

#[test]
fn test_reprompt_restates_only_missing_params() {
    let spec = ScenarioSpec::builder("transfer", "Gift Game")
        .grammar(ActionGrammar::freeform(
            "action",
            vec![
                ParamSpec::required("recipient", "who receives the gift"),
                ParamSpec::required("amount", "how many tokens to send"),
            ],
        ))
        .build()
        .unwrap();

    let reprompt = build_reprompt(
        &AgentState::new("Alice"),
        &spec,
        &EventView::pre_round(),
        "transfer",
        &["amount".to_string()],
    );
    assert!(reprompt.contains("You chose to transfer."));
    assert!(reprompt.contains("still needs: amount"));
    assert!(reprompt.contains("how many tokens to send"));
    // The satisfied parameter is not restated in the missing clause.
    assert!(!reprompt.contains("still needs: recipient"));
}
