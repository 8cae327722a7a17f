//! Shared primitives for provider-agnostic LM clients.
//!
//! The kernel talks to language-model services exclusively through the
//! [`LlmClient`] trait and the lightweight data types in this module. The
//! trait abstracts over concrete vendor implementations; everything above it
//! (turn pipeline, round runner, summariser) is provider-blind.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use agorasim::client_wrapper::{ChatOptions, LlmClient, Message, Role};
//! use agorasim::clients::openai::{Model, OpenAIClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let key = std::env::var("OPEN_AI_SECRET")?;
//!     let client = OpenAIClient::new_with_model_enum(&key, Model::GPT41Nano);
//!
//!     let text = client
//!         .chat(
//!             &[Message {
//!                 role: Role::User,
//!                 content: Arc::from("Choose cooperate or defect."),
//!             }],
//!             &ChatOptions::default(),
//!         )
//!         .await?;
//!
//!     println!("Assistant: {}", text);
//!     Ok(())
//! }
//! ```
//!
//! # Requesting structured output
//!
//! Scenario runs pass `json_mode = true` plus the decoding schema produced by
//! [`build_schema`](crate::scenario::build_schema). Providers that support
//! constrained decoding enforce the schema server-side; for the rest the
//! [action validator](crate::validator) handles the free text.

use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Represents the possible roles for a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message (prompts, environment feedback, re-prompts).
    User,
    /// An assistant authored message (model responses).
    Assistant,
}

/// Represents a generic message to be sent to an LM.
#[derive(Clone)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body. Stored as `Arc<str>` so rendered contexts can be
    /// cheaply cloned when a round fans out over many agents.
    pub content: Arc<str>,
}

impl Message {
    /// Convenience constructor from anything string-like.
    pub fn new(role: Role, content: impl AsRef<str>) -> Self {
        Self {
            role,
            content: Arc::from(content.as_ref()),
        }
    }
}

/// How many tokens were spent on prompt vs. completion?
#[derive(Clone, Debug)]
pub struct TokenUsage {
    /// Number of prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Number of generated/output tokens billed by the provider.
    pub output_tokens: usize,
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub total_tokens: usize,
}

/// Per-call options forwarded to [`LlmClient::chat`].
///
/// `deadline` is enforced by implementations via `tokio::time::timeout`; the
/// kernel always sets it from
/// [`KernelConfig::llm_call_timeout`](crate::config::KernelConfig::llm_call_timeout)
/// when driving turns.
#[derive(Clone, Debug, Default)]
pub struct ChatOptions {
    /// Ask the provider for structured (JSON) output.
    pub json_mode: bool,
    /// Optional decoding schema for providers with constrained decoding.
    /// Ignored by providers that cannot enforce it.
    pub schema: Option<serde_json::Value>,
    /// Cap on generated tokens, when the provider supports one.
    pub max_tokens: Option<u32>,
    /// Wall-clock budget for the whole call.
    pub deadline: Option<Duration>,
}

/// Trait defining the interface to interact with various LM services.
///
/// All implementations **must** be thread-safe (`Send + Sync`) so they can be
/// shared between async tasks: a simultaneous round clones one
/// `Arc<dyn LlmClient>` per agent. Where a provider exposes token accounting,
/// wrappers should capture it and make it visible via
/// [`LlmClient::get_last_usage`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a full request/response style chat completion and return the
    /// assistant's text.
    ///
    /// The `messages` slice must include any system priming messages the
    /// caller wishes to send. Honouring `options.json_mode` / `options.schema`
    /// is best-effort: providers without structured output return free text
    /// and the caller's validator copes.
    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;

    /// Embed a text into a vector. Optional; used by scaffolding outside the
    /// kernel, never by the turn pipeline.
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, Box<dyn Error + Send + Sync>> {
        Err("embeddings not supported by this client".into())
    }

    /// Return the identifier used to select the upstream model (e.g. `"gpt-4.1"`).
    fn model_name(&self) -> &str;

    /// Hook to retrieve usage from the most recent [`LlmClient::chat`] call.
    async fn get_last_usage(&self) -> Option<TokenUsage> {
        if let Some(slot) = self.usage_slot() {
            slot.lock().await.clone()
        } else {
            None
        }
    }

    /// Expose a shared mutable slot where the implementation can persist
    /// token usage. By default wrappers report no usage data.
    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        None
    }
}

/// Named LM clients available to a simulation.
///
/// Agents carry an `llm_binding` string; the kernel resolves it here. The
/// `"default"` binding is the fallback for agents whose binding is absent
/// from the map.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use agorasim::client_wrapper::LlmBindings;
/// use agorasim::clients::mock::MockClient;
///
/// let mut bindings = LlmBindings::new(Arc::new(MockClient::always("{}")));
/// bindings.insert("fast", Arc::new(MockClient::always("{}")));
/// assert!(bindings.resolve("fast").is_some());
/// assert!(bindings.resolve("unknown-binding").is_some()); // falls back to default
/// ```
#[derive(Clone)]
pub struct LlmBindings {
    clients: HashMap<String, Arc<dyn LlmClient>>,
}

impl LlmBindings {
    /// Create a binding table with the given default client.
    pub fn new(default: Arc<dyn LlmClient>) -> Self {
        let mut clients = HashMap::new();
        clients.insert("default".to_string(), default);
        Self { clients }
    }

    /// Register a client under a binding name.
    pub fn insert(&mut self, binding: impl Into<String>, client: Arc<dyn LlmClient>) {
        self.clients.insert(binding.into(), client);
    }

    /// Resolve a binding, falling back to `"default"`.
    pub fn resolve(&self, binding: &str) -> Option<Arc<dyn LlmClient>> {
        self.clients
            .get(binding)
            .or_else(|| self.clients.get("default"))
            .cloned()
    }

    /// The default client. Present by construction.
    pub fn default_client(&self) -> Arc<dyn LlmClient> {
        self.clients
            .get("default")
            .cloned()
            .expect("LlmBindings always holds a default client")
    }
}
