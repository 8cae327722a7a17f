use agorasim::client_wrapper::{ChatOptions, LlmBindings, LlmClient, Message, Role};
use agorasim::clients::gemini;
use agorasim::clients::mock::MockClient;
use agorasim::clients::ollama::OllamaClient;
use agorasim::clients::openai;
use std::sync::Arc;

#[test]
fn test_openai_model_to_string() {
    assert_eq!(openai::model_to_string(openai::Model::GPT41Nano), "gpt-4.1-nano");
    assert_eq!(openai::model_to_string(openai::Model::GPT4o), "gpt-4o");
    assert_eq!(openai::model_to_string(openai::Model::O4Mini), "o4-mini");
}

#[test]
fn test_gemini_model_to_string() {
    assert_eq!(
        gemini::model_to_string(gemini::Model::Gemini25Flash),
        "gemini-2.5-flash"
    );
    assert_eq!(
        gemini::model_to_string(gemini::Model::Gemini15Flash8b),
        "gemini-1.5-flash-8b"
    );
}

#[test]
fn test_client_constructors_record_model_name() {
    let client = openai::OpenAIClient::new_with_model_string("key", "gpt-4.1-mini");
    assert_eq!(LlmClient::model_name(&client), "gpt-4.1-mini");

    let client = gemini::GeminiClient::new_with_model_enum("key", gemini::Model::Gemini25Pro);
    assert_eq!(LlmClient::model_name(&client), "gemini-2.5-pro");

    let client = OllamaClient::new("http://localhost:11434/", "llama3.2");
    assert_eq!(LlmClient::model_name(&client), "llama3.2");
}

#[test]
fn test_bindings_fall_back_to_default() {
    let mut bindings = LlmBindings::new(Arc::new(MockClient::always("default")));
    bindings.insert("fast", Arc::new(MockClient::always("fast")));

    assert!(bindings.resolve("fast").is_some());
    let fallback = bindings.resolve("no-such-binding").unwrap();
    assert_eq!(fallback.model_name(), "mock");
}

#[tokio::test]
async fn test_mock_routes_by_prompt_content() {
    let client = MockClient::always(r#"{"action":"cooperate"}"#)
        .with_route("Bob", vec![r#"{"action":"defect"}"#.to_string()]);

    let alice = client
        .chat(
            &[Message::new(Role::System, "You are Alice.")],
            &ChatOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(alice, r#"{"action":"cooperate"}"#);

    let bob = client
        .chat(
            &[Message::new(Role::System, "You are Bob.")],
            &ChatOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(bob, r#"{"action":"defect"}"#);
}

#[tokio::test]
async fn test_mock_scripted_responses_pop_and_last_sticks() {
    let client = MockClient::scripted(vec!["one".to_string(), "two".to_string()]);
    let options = ChatOptions::default();
    let message = [Message::new(Role::User, "go")];

    assert_eq!(client.chat(&message, &options).await.unwrap(), "one");
    assert_eq!(client.chat(&message, &options).await.unwrap(), "two");
    assert_eq!(client.chat(&message, &options).await.unwrap(), "two");
    assert_eq!(client.call_count().await, 3);
}

#[tokio::test]
async fn test_mock_injected_failures_then_success() {
    let client = MockClient::always("ok").with_failures(2, "connection reset");
    let options = ChatOptions::default();
    let message = [Message::new(Role::User, "go")];

    assert!(client.chat(&message, &options).await.is_err());
    assert!(client.chat(&message, &options).await.is_err());
    assert_eq!(client.chat(&message, &options).await.unwrap(), "ok");
}

#[tokio::test]
async fn test_mock_captures_prompts() {
    let client = MockClient::always("ok");
    client
        .chat(
            &[
                Message::new(Role::System, "You are Alice."),
                Message::new(Role::User, "Pick an action."),
            ],
            &ChatOptions::default(),
        )
        .await
        .unwrap();

    let prompts = client.captured_prompts().await;
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("You are Alice."));
    assert!(prompts[0].contains("Pick an action."));
}

#[tokio::test]
async fn test_mock_embedding_is_deterministic() {
    let client = MockClient::always("ok");
    let a = client.embed("hello world").await.unwrap();
    let b = client.embed("hello world").await.unwrap();
    let c = client.embed("different text").await.unwrap();
    assert_eq!(a, b);
    assert_eq!(a.len(), 8);
    assert_ne!(a, c);
}
