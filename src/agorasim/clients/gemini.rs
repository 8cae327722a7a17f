//! Google Gemini client wrapper exposing the [`LlmClient`] trait.
//!
//! The `GeminiClient` connects to Google's Generative Language (Gemini) API
//! using the same message structures and token accounting abstractions
//! employed by the rest of agorasim.
//!
//! This dialect honours [`ChatOptions::json_mode`] natively: the request sets
//! `responseMimeType: "application/json"` and, when a decoding schema is
//! supplied, forwards it as `responseSchema` so the provider constrains the
//! output server-side.
//!
//! # Selecting a model and sending a message
//!
//! ```rust,no_run
//! use agorasim::client_wrapper::{ChatOptions, LlmClient, Message, Role};
//! use agorasim::clients::gemini::{GeminiClient, Model};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let key = std::env::var("GEMINI_KEY")?;
//!     let client = GeminiClient::new_with_model_enum(&key, Model::Gemini25Flash);
//!     let reply = client
//!         .chat(
//!             &[Message::new(Role::User, "Pick a number from 1 to 7.")],
//!             &ChatOptions::default(),
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

/// Client wrapper for Google Gemini (Generative Language) chat-style endpoints.
pub struct GeminiClient {
    /// Model identifier used for subsequent requests.
    pub model: String,
    /// Storage for the most recent token usage report.
    token_usage: Mutex<Option<TokenUsage>>,
    /// API key (Gemini uses query parameters instead of a bearer token).
    api_key: String,
    /// Base URL for API calls.
    base_url: String,
}

/// Gemini model identifiers accepted by the public API.
///
/// Every variant maps 1:1 to the hyphenated model name that the API expects.
/// Use [`model_to_string`] when you need the string literal.
pub enum Model {
    Gemini20Flash,
    Gemini20FlashLite001,
    Gemini15Pro,
    Gemini15Flash,
    Gemini15Flash8b,
    Gemini25Flash,
    Gemini25Pro,
    TextEmbedding004,
}

/// Convert a strongly typed [`Model`] into the string literal expected by the
/// Gemini endpoint.
pub fn model_to_string(model: Model) -> String {
    match model {
        Model::Gemini20Flash => "gemini-2.0-flash".to_string(),
        Model::Gemini20FlashLite001 => "gemini-2.0-flash-lite-001".to_string(),
        Model::Gemini15Pro => "gemini-1.5-pro".to_string(),
        Model::Gemini15Flash => "gemini-1.5-flash".to_string(),
        Model::Gemini15Flash8b => "gemini-1.5-flash-8b".to_string(),
        Model::Gemini25Flash => "gemini-2.5-flash".to_string(),
        Model::Gemini25Pro => "gemini-2.5-pro".to_string(),
        Model::TextEmbedding004 => "text-embedding-004".to_string(),
    }
}

impl GeminiClient {
    /// Construct a client using the default Gemini base URL and an explicit
    /// model name.
    pub fn new_with_model_string(secret_key: &str, model_name: &str) -> Self {
        GeminiClient {
            model: model_name.to_string(),
            token_usage: Mutex::new(None),
            api_key: secret_key.to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }

    /// Construct a client from an API key and [`Model`] variant.
    pub fn new_with_model_enum(secret_key: &str, model: Model) -> Self {
        Self::new_with_model_string(secret_key, &model_to_string(model))
    }

    /// This function is used to create a GeminiClient with a custom base URL.
    /// Note: base_url should not have a trailing slash.
    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        GeminiClient {
            model: model_name.to_string(),
            token_usage: Mutex::new(None),
            api_key: secret_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Build the `contents`/`systemInstruction` request body for a
    /// generateContent call.
    fn build_request_body(&self, messages: &[Message], options: &ChatOptions) -> serde_json::Value {
        // Gemini separates system instructions from the turn contents and
        // names the assistant role "model".
        let mut system_parts: Vec<serde_json::Value> = Vec::new();
        let mut contents: Vec<serde_json::Value> = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => {
                    system_parts.push(json!({"text": msg.content.as_ref()}));
                }
                Role::User => {
                    contents.push(json!({
                        "role": "user",
                        "parts": [{"text": msg.content.as_ref()}]
                    }));
                }
                Role::Assistant => {
                    contents.push(json!({
                        "role": "model",
                        "parts": [{"text": msg.content.as_ref()}]
                    }));
                }
            }
        }

        let mut generation_config = serde_json::Map::new();
        if options.json_mode {
            generation_config.insert(
                "responseMimeType".to_string(),
                json!("application/json"),
            );
            if let Some(schema) = &options.schema {
                generation_config.insert("responseSchema".to_string(), schema.clone());
            }
        }
        if let Some(max_tokens) = options.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }

        let mut body = serde_json::Map::new();
        body.insert("contents".to_string(), json!(contents));
        if !system_parts.is_empty() {
            body.insert(
                "systemInstruction".to_string(),
                json!({"parts": system_parts}),
            );
        }
        if !generation_config.is_empty() {
            body.insert(
                "generationConfig".to_string(),
                serde_json::Value::Object(generation_config),
            );
        }

        serde_json::Value::Object(body)
    }

    async fn post_generate_content(
        &self,
        body: &serde_json::Value,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let http_client = get_shared_http_client();
        let response = http_client.post(&url).json(body).send().await?;
        let response_text = response.text().await?;

        if log::log_enabled!(log::Level::Debug) {
            log::debug!("Gemini generateContent response: {}", response_text);
        }

        let response_json: serde_json::Value = serde_json::from_str(&response_text)?;

        // Check for API errors
        if let Some(err) = response_json.get("error") {
            if let Some(message) = err.get("message").and_then(|m| m.as_str()) {
                return Err(format!("Gemini API error: {}", message).into());
            }
            return Err("Gemini API returned an error".into());
        }

        // Token accounting lives in usageMetadata
        if let Some(usage) = response_json.get("usageMetadata") {
            let input = usage
                .get("promptTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            let output = usage
                .get("candidatesTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            track_usage_fields(&self.token_usage, input, output).await;
        }

        // Text lives in candidates[0].content.parts[].text
        let mut text = String::new();
        if let Some(parts) = response_json
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
        {
            for part in parts {
                if let Some(chunk) = part.get("text").and_then(|t| t.as_str()) {
                    text.push_str(chunk);
                }
            }
        }

        if text.is_empty() {
            return Err("Gemini API response contained no text candidates".into());
        }

        Ok(text)
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let body = self.build_request_body(messages, options);

        let fut = self.post_generate_content(&body);
        let result = match options.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, fut).await {
                Ok(result) => result,
                Err(_) => Err(format!("LM call exceeded deadline of {:?}", deadline).into()),
            },
            None => fut.await,
        };

        if let Err(err) = &result {
            if log::log_enabled!(log::Level::Error) {
                error!("GeminiClient::chat error: {}", err);
            }
        }
        result
    }

    /// Embed text via Gemini's `embedContent` endpoint using
    /// `text-embedding-004`.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, Box<dyn Error + Send + Sync>> {
        let embed_model = model_to_string(Model::TextEmbedding004);
        let url = format!(
            "{}/models/{}:embedContent?key={}",
            self.base_url, embed_model, self.api_key
        );
        let body = json!({
            "model": format!("models/{}", embed_model),
            "content": {"parts": [{"text": text}]}
        });

        let http_client = get_shared_http_client();
        let response = http_client.post(&url).json(&body).send().await?;
        let response_json: serde_json::Value = response.json().await?;

        if let Some(err) = response_json.get("error") {
            if let Some(message) = err.get("message").and_then(|m| m.as_str()) {
                return Err(format!("Gemini API error: {}", message).into());
            }
            return Err("Gemini API returned an error".into());
        }

        let values = response_json
            .get("embedding")
            .and_then(|e| e.get("values"))
            .and_then(|v| v.as_array())
            .ok_or("Gemini embedContent response missing embedding values")?;

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
