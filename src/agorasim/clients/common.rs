//! Shared utilities used across provider client implementations.
//!
//! The helpers in this module are useful when implementing additional
//! providers that expose an OpenAI-compatible HTTP surface. They provide a
//! tuned [`reqwest`] client and a convenience function for sending chat
//! requests while persisting token accounting.

use crate::client_wrapper::TokenUsage;
use lazy_static::lazy_static;
use openai_rust::chat;
use openai_rust2 as openai_rust;
use std::error::Error;
use std::time::Duration;
use tokio::sync::Mutex;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// The single client instance keeps TLS sessions and DNS lookups warm
    /// which significantly reduces latency when a simultaneous round issues
    /// many concurrent requests to upstream providers.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
///
/// The returned reference can be cloned and reused by individual client
/// wrappers.
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Send a chat completion request, persist token usage, and surface the
/// assistant content.
///
/// Captures the common logic shared by OpenAI-compatible endpoints.
pub async fn send_and_track(
    api: &openai_rust::Client,
    model: &str,
    formatted_msgs: Vec<chat::Message>,
    url_path: Option<String>,
    usage_slot: &Mutex<Option<TokenUsage>>,
) -> Result<String, Box<dyn Error + Send + Sync>> {
    let chat_arguments = chat::ChatArguments::new(model, formatted_msgs);

    let response = api.create_chat(chat_arguments, url_path).await;

    match response {
        Ok(response) => {
            let usage = TokenUsage {
                input_tokens: response.usage.prompt_tokens as usize,
                output_tokens: response.usage.completion_tokens as usize,
                total_tokens: response.usage.total_tokens as usize,
            };

            // Store it for get_last_usage()
            *usage_slot.lock().await = Some(usage);

            Ok(response.choices[0].message.content.clone())
        }
        Err(err) => {
            if log::log_enabled!(log::Level::Error) {
                log::error!(
                    "agorasim::clients::common::send_and_track(...): API Error: {}",
                    err
                );
            }
            Err(err.to_string().into())
        }
    }
}

/// Record an OpenAI-style `usage` object parsed out of a raw JSON response.
///
/// Shared by the reqwest-based dialects ([`gemini`](crate::clients::gemini),
/// [`ollama`](crate::clients::ollama)) whose wire formats differ but whose
/// accounting fields are close enough to normalise here.
pub async fn track_usage_fields(
    usage_slot: &Mutex<Option<TokenUsage>>,
    input_tokens: usize,
    output_tokens: usize,
) {
    *usage_slot.lock().await = Some(TokenUsage {
        input_tokens,
        output_tokens,
        total_tokens: input_tokens + output_tokens,
    });
}
