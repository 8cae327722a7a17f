//! OpenAI Chat Completions client that captures token usage statistics.
//!
//! # Key Features
//!
//! - **`chat`**: returns the assistant text the turn pipeline feeds into the
//!   [action validator](crate::validator).
//! - **Automatic usage capture**: the last token accounting is stored in a
//!   shared slot.
//! - **Deadline support**: `ChatOptions::deadline` is enforced with
//!   `tokio::time::timeout`.
//!
//! Structured output for this dialect is requested through the prompt (the
//! strict-JSON instruction section); `ChatOptions::schema` is advisory and
//! the validator remains the backstop.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use agorasim::client_wrapper::{ChatOptions, LlmClient, Message, Role};
//! use agorasim::clients::openai::{Model, OpenAIClient};
//!
//! #[tokio::main]
//! async fn main() {
//!     let secret_key: String = std::env::var("OPEN_AI_SECRET").expect("OPEN_AI_SECRET not set");
//!     let client = OpenAIClient::new_with_model_enum(&secret_key, Model::GPT41Nano);
//!
//!     let text = client
//!         .chat(
//!             &[
//!                 Message::new(Role::System, "You are Alice in a negotiation."),
//!                 Message::new(Role::User, "Respond with JSON."),
//!             ],
//!             &ChatOptions { json_mode: true, ..ChatOptions::default() },
//!         )
//!         .await
//!         .unwrap();
//!     println!("Assistant: {}", text);
//!
//!     if let Some(usage) = client.get_last_usage().await {
//!         println!(
//!             "Tokens — input: {}, output: {}, total: {}",
//!             usage.input_tokens, usage.output_tokens, usage.total_tokens
//!         );
//!     }
//! }
//! ```

use std::error::Error;

use async_trait::async_trait;
use openai_rust::chat;
use openai_rust2 as openai_rust;
use tokio::sync::Mutex;

use crate::client_wrapper::{ChatOptions, LlmClient, Message, Role, TokenUsage};
use crate::clients::common::{get_shared_http_client, send_and_track};

/// Official model identifiers supported by OpenAI's Chat Completions API.
#[allow(non_camel_case_types)]
pub enum Model {
    /// `gpt-5` – high-reasoning, medium latency, text or multimodal input.
    GPT5,
    /// `gpt-5-mini` – fast variant of GPT-5 with balanced cost and quality.
    GPT5Mini,
    /// `gpt-5-nano` – lowest latency GPT-5 configuration.
    GPT5Nano,
    /// `gpt-4o` – Omni model with text + image inputs.
    GPT4o,
    /// `gpt-4o-mini` – cost effective GPT-4o derivative.
    GPt4oMini,
    /// `o3` – general availability O-series release.
    O3,
    /// `o4-mini` – newest O-series low-latency tier.
    O4Mini,
    /// `gpt-4.1` – general availability GPT-4.1.
    GPT41,
    /// `gpt-4.1-mini` – reduced cost GPT-4.1 tier.
    GPT41Mini,
    /// `gpt-4.1-nano` – ultra low cost GPT-4.1 derivative.
    GPT41Nano,
}

/// Convert a [`Model`] variant into the string identifier expected by the REST API.
pub fn model_to_string(model: Model) -> String {
    match model {
        Model::GPT5 => "gpt-5".to_string(),
        Model::GPT5Mini => "gpt-5-mini".to_string(),
        Model::GPT5Nano => "gpt-5-nano".to_string(),
        Model::GPT4o => "gpt-4o".to_string(),
        Model::GPt4oMini => "gpt-4o-mini".to_string(),
        Model::O3 => "o3".to_string(),
        Model::O4Mini => "o4-mini".to_string(),
        Model::GPT41 => "gpt-4.1".to_string(),
        Model::GPT41Mini => "gpt-4.1-mini".to_string(),
        Model::GPT41Nano => "gpt-4.1-nano".to_string(),
    }
}

/// Client wrapper for OpenAI-compatible Chat Completions endpoints.
pub struct OpenAIClient {
    client: openai_rust::Client,
    /// Model identifier used for subsequent requests.
    pub model: String,
    /// Storage for the most recent token usage report.
    token_usage: Mutex<Option<TokenUsage>>,
    url_path: Option<String>,
}

impl OpenAIClient {
    /// Construct a client from an API key and an explicit model name.
    pub fn new_with_model_string(secret_key: &str, model_name: &str) -> Self {
        OpenAIClient {
            client: openai_rust::Client::new_with_client(
                secret_key,
                get_shared_http_client().clone(),
            ),
            model: model_name.to_string(),
            token_usage: Mutex::new(None),
            url_path: None,
        }
    }

    /// Construct a client from an API key and [`Model`] variant.
    pub fn new_with_model_enum(secret_key: &str, model: Model) -> Self {
        Self::new_with_model_string(secret_key, &model_to_string(model))
    }

    /// Construct a client against an OpenAI-compatible endpoint hosted at a
    /// custom base URL (e.g. a gateway or a compatible local server).
    /// `base_url` should not have a trailing slash.
    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        let base_url_normalized = base_url.trim_end_matches('/');
        OpenAIClient {
            client: openai_rust::Client::new_with_client_and_base_url(
                secret_key,
                get_shared_http_client().clone(),
                &format!("{}/", base_url_normalized),
            ),
            model: model_name.to_string(),
            token_usage: Mutex::new(None),
            url_path: Some("/v1/chat/completions".to_string()),
        }
    }
}

#[async_trait]
impl LlmClient for OpenAIClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let mut formatted_messages = Vec::with_capacity(messages.len());
        for msg in messages {
            formatted_messages.push(chat::Message {
                role: match msg.role {
                    Role::System => "system".to_owned(),
                    Role::User => "user".to_owned(),
                    Role::Assistant => "assistant".to_owned(),
                },
                content: msg.content.to_string(),
            });
        }

        let fut = send_and_track(
            &self.client,
            &self.model,
            formatted_messages,
            self.url_path.clone(),
            &self.token_usage,
        );

        match options.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, fut).await {
                Ok(result) => result,
                Err(_) => {
                    if log::log_enabled!(log::Level::Error) {
                        log::error!(
                            "OpenAIClient::chat: deadline of {:?} exceeded for model {}",
                            deadline,
                            self.model
                        );
                    }
                    Err(format!("LM call exceeded deadline of {:?}", deadline).into())
                }
            },
            None => fut.await,
        }
    }

    /// Expose the storage slot used by [`LlmClient::get_last_usage`].
    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.token_usage)
    }
}
