use agorasim::agent_state::{AgentState, MediaRefs, MemoryRole};
use agorasim::client_wrapper::Role;
use agorasim::scenario::{ActionGrammar, ScenarioSpec};
use serde_json::json;

fn spec_with_rules() -> ScenarioSpec {
    ScenarioSpec::builder("chat", "Free Chat")
        .grammar(ActionGrammar::discrete("action", &["speak", "listen"]))
        .rule("Stay in character.")
        .rule("Keep replies short.")
        .build()
        .unwrap()
}

#[test]
fn test_adjacent_same_role_plain_entries_merge() {
    let mut agent = AgentState::new("Alice");
    agent.append_memory(MemoryRole::User, "first line", MediaRefs::default());
    agent.append_memory(MemoryRole::User, "second line", MediaRefs::default());

    assert_eq!(agent.short_memory.len(), 1);
    assert_eq!(
        agent.short_memory.entries()[0].content,
        "first line\nsecond line"
    );
}

#[test]
fn test_different_roles_do_not_merge() {
    let mut agent = AgentState::new("Alice");
    agent.append_memory(MemoryRole::User, "question", MediaRefs::default());
    agent.append_memory(MemoryRole::Assistant, "answer", MediaRefs::default());

    assert_eq!(agent.short_memory.len(), 2);
}

#[test]
fn test_entries_with_media_never_merge() {
    let mut agent = AgentState::new("Alice");
    agent.append_memory(MemoryRole::User, "look at this", MediaRefs::default());
    agent.append_memory(
        MemoryRole::User,
        "a photo",
        MediaRefs::images(vec!["https://example.com/p.png".to_string()]),
    );
    agent.append_memory(MemoryRole::User, "and a caption", MediaRefs::default());

    // Neither into the media entry nor out of it.
    assert_eq!(agent.short_memory.len(), 3);
    assert!(!agent.short_memory.entries()[1].media.is_empty());
}

#[test]
fn test_env_feedback_lands_as_user_role() {
    let mut agent = AgentState::new("Bob");
    agent.inject_env_feedback("[18:03] Alice: hi", MediaRefs::default());

    let entry = &agent.short_memory.entries()[0];
    assert_eq!(entry.role, MemoryRole::User);
    assert_eq!(entry.content, "[18:03] Alice: hi");
}

#[test]
fn test_render_context_synthesises_system_message() {
    let mut agent = AgentState::new("Alice")
        .with_property("profession", json!("mediator"))
        .with_property("patience", json!(71));
    agent.rolling_summary = "The council is deadlocked.".to_string();
    agent.append_memory(MemoryRole::User, "Bob: I disagree.", MediaRefs::default());

    let messages = agent.render_context(&spec_with_rules());

    assert!(messages.len() >= 2);
    assert_eq!(messages[0].role, Role::System);
    let system = messages[0].content.as_ref();
    assert!(system.contains("You are Alice."));
    assert!(system.contains("profession: mediator"));
    assert!(system.contains("Stay in character."));
    assert!(system.contains("The council is deadlocked."));

    assert_eq!(messages[1].role, Role::User);
    assert_eq!(messages[1].content.as_ref(), "Bob: I disagree.");
}

#[test]
fn test_agent_state_round_trips_through_json() {
    let mut agent = AgentState::new("Alice")
        .with_property("trust", json!(40))
        .with_llm_binding("fast");
    agent.rolling_summary = "So far so good.".to_string();
    agent.append_memory(MemoryRole::Assistant, "[18:00] Alice chose speak", MediaRefs::default());

    let json = serde_json::to_string(&agent).unwrap();
    let restored: AgentState = serde_json::from_str(&json).unwrap();
    assert_eq!(agent, restored);
}
