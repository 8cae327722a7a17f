//! Ollama client wrapper for locally hosted models.
//!
//! Talks to an Ollama-compatible server (`/api/chat`, `/api/embeddings`).
//! [`ChatOptions::json_mode`] maps to Ollama's `format: "json"` request field;
//! when a decoding schema is supplied it is forwarded verbatim as the
//! `format` value, which newer servers accept for grammar-constrained output.
//!
//! # Example
//!
//! ```rust,no_run
//! use agorasim::client_wrapper::{ChatOptions, LlmClient, Message, Role};
//! use agorasim::clients::ollama::OllamaClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let client = OllamaClient::new("http://localhost:11434", "llama3.2");
//!     let reply = client
//!         .chat(
//!             &[Message::new(Role::User, "cooperate or defect?")],
//!             &ChatOptions { json_mode: true, ..ChatOptions::default() },
//!         )
//!         .await?;
//!     println!("{}", reply);
//!     Ok(())
//! }
//! ```

use crate::client_wrapper::{ChatOptions, LlmClient, Message, Role, TokenUsage};
use crate::clients::common::{get_shared_http_client, track_usage_fields};
use async_trait::async_trait;
use log::error;
use serde_json::json;
use std::error::Error;
use tokio::sync::Mutex;

/// Client wrapper for an Ollama-compatible local inference server.
pub struct OllamaClient {
    /// Model identifier used for subsequent requests (e.g. `"llama3.2"`).
    pub model: String,
    /// Storage for the most recent token usage report.
    token_usage: Mutex<Option<TokenUsage>>,
    base_url: String,
}

impl OllamaClient {
    /// Construct a client against the given server. `base_url` should not
    /// have a trailing slash (e.g. `"http://localhost:11434"`).
    pub fn new(base_url: &str, model_name: &str) -> Self {
        OllamaClient {
            model: model_name.to_string(),
            token_usage: Mutex::new(None),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post_chat(
        &self,
        body: &serde_json::Value,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let url = format!("{}/api/chat", self.base_url);
        let http_client = get_shared_http_client();
        let response = http_client.post(&url).json(body).send().await?;
        let status = response.status();
        let response_text = response.text().await?;

        if !status.is_success() {
            return Err(format!("Ollama HTTP {}: {}", status, response_text).into());
        }

        let response_json: serde_json::Value = serde_json::from_str(&response_text)?;

        if let Some(err) = response_json.get("error").and_then(|e| e.as_str()) {
            return Err(format!("Ollama API error: {}", err).into());
        }

        // prompt_eval_count / eval_count mirror input/output token counts.
        let input = response_json
            .get("prompt_eval_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        let output = response_json
            .get("eval_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        if input + output > 0 {
            track_usage_fields(&self.token_usage, input, output).await;
        }

        response_json
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| "Ollama response contained no message content".into())
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let formatted: Vec<serde_json::Value> = messages
            .iter()
            .map(|msg| {
                json!({
                    "role": match msg.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    "content": msg.content.as_ref(),
                })
            })
            .collect();

        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), json!(self.model));
        body.insert("messages".to_string(), json!(formatted));
        body.insert("stream".to_string(), json!(false));
        if options.json_mode {
            match &options.schema {
                Some(schema) => body.insert("format".to_string(), schema.clone()),
                None => body.insert("format".to_string(), json!("json")),
            };
        }
        if let Some(max_tokens) = options.max_tokens {
            body.insert("options".to_string(), json!({"num_predict": max_tokens}));
        }
        let body = serde_json::Value::Object(body);

        let fut = self.post_chat(&body);
        let result = match options.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, fut).await {
                Ok(result) => result,
                Err(_) => Err(format!("LM call exceeded deadline of {:?}", deadline).into()),
            },
            None => fut.await,
        };

        if let Err(err) = &result {
            if log::log_enabled!(log::Level::Error) {
                error!("OllamaClient::chat error: {}", err);
            }
        }
        result
    }

    /// Embed text via `/api/embeddings`.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, Box<dyn Error + Send + Sync>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let body = json!({"model": self.model, "prompt": text});

        let http_client = get_shared_http_client();
        let response = http_client.post(&url).json(&body).send().await?;
        let response_json: serde_json::Value = response.json().await?;

        if let Some(err) = response_json.get("error").and_then(|e| e.as_str()) {
            return Err(format!("Ollama API error: {}", err).into());
        }

        let values = response_json
            .get("embedding")
            .and_then(|v| v.as_array())
            .ok_or("Ollama embeddings response missing embedding field")?;

        Ok(values
            .iter()
            .filter_map(|v| v.as_f64())
            .map(|v| v as f32)
            .collect())
    }

    /// Expose the storage slot used by [`LlmClient::get_last_usage`].
    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.token_usage)
    }
}
