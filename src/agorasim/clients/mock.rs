//! Scripted in-process LM client for tests and offline runs.
//!
//! The original platform ships a "mock" dialect its own test suite runs
//! against; this is the agorasim equivalent. A [`MockClient`] never touches
//! the network: it answers from canned response queues, optionally routed by
//! a substring match on the rendered prompt (typically the agent's name from
//! the system message), with optional artificial latency and injected
//! transport failures.
//!
//! # Example
//!
//! ```rust,no_run
//! use agorasim::client_wrapper::{ChatOptions, LlmClient, Message, Role};
//! use agorasim::clients::mock::MockClient;
//!
//! # async {
//! let client = MockClient::always(r#"{"action":"cooperate"}"#)
//!     .with_route("Bob", vec![r#"{"action":"defect"}"#.to_string()]);
//!
//! let reply = client
//!     .chat(&[Message::new(Role::System, "You are Bob.")], &ChatOptions::default())
//!     .await
//!     .unwrap();
//! assert_eq!(reply, r#"{"action":"defect"}"#);
//! # };
//! ```

use crate::client_wrapper::{ChatOptions, LlmClient, Message, TokenUsage};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::error::Error;
use std::time::Duration;
use tokio::sync::Mutex;

struct Route {
    pattern: String,
    responses: Mutex<VecDeque<String>>,
}

/// Scripted LM client. See the module docs for usage.
pub struct MockClient {
    default_responses: Mutex<VecDeque<String>>,
    routes: Vec<Route>,
    delay: Option<Duration>,
    /// Number of calls that fail before responses start flowing.
    failures_remaining: Mutex<u32>,
    failure_message: String,
    captured: Mutex<Vec<String>>,
    token_usage: Mutex<Option<TokenUsage>>,
}

impl MockClient {
    /// A client that answers every call with the same text.
    pub fn always(text: impl Into<String>) -> Self {
        Self::scripted(vec![text.into()])
    }

    /// A client that pops `responses` in order; the final response sticks for
    /// all subsequent calls.
    pub fn scripted(responses: Vec<String>) -> Self {
        MockClient {
            default_responses: Mutex::new(responses.into_iter().collect()),
            routes: Vec::new(),
            delay: None,
            failures_remaining: Mutex::new(0),
            failure_message: String::new(),
            captured: Mutex::new(Vec::new()),
            token_usage: Mutex::new(None),
        }
    }

    /// Route calls whose rendered prompt contains `pattern` to a dedicated
    /// response queue. Routes are checked in registration order before the
    /// default queue.
    pub fn with_route(mut self, pattern: impl Into<String>, responses: Vec<String>) -> Self {
        self.routes.push(Route {
            pattern: pattern.into(),
            responses: Mutex::new(responses.into_iter().collect()),
        });
        self
    }

    /// Sleep for `delay` before answering each call. Used to exercise
    /// completion-order independence and cancellation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the first `count` calls with a transport-style error.
    pub fn with_failures(mut self, count: u32, message: impl Into<String>) -> Self {
        self.failures_remaining = Mutex::new(count);
        self.failure_message = message.into();
        self
    }

    /// Every prompt this client has seen, one concatenated string per call.
    pub async fn captured_prompts(&self) -> Vec<String> {
        self.captured.lock().await.clone()
    }

    /// Number of `chat` calls made so far (including injected failures).
    pub async fn call_count(&self) -> usize {
        self.captured.lock().await.len()
    }

    fn pop_or_repeat(queue: &mut VecDeque<String>) -> Option<String> {
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl LlmClient for MockClient {
    fn model_name(&self) -> &str {
        "mock"
    }

    async fn chat(
        &self,
        messages: &[Message],
        _options: &ChatOptions,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let rendered = messages
            .iter()
            .map(|m| m.content.as_ref())
            .collect::<Vec<_>>()
            .join("\n");
        self.captured.lock().await.push(rendered.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.failures_remaining.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(self.failure_message.clone().into());
            }
        }

        for route in &self.routes {
            if rendered.contains(&route.pattern) {
                if let Some(text) = Self::pop_or_repeat(&mut *route.responses.lock().await) {
                    return Ok(text);
                }
            }
        }

        Self::pop_or_repeat(&mut *self.default_responses.lock().await)
            .ok_or_else(|| "MockClient has no scripted response left".into())
    }

    /// Deterministic toy embedding so scaffolding tests have something to
    /// assert against.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, Box<dyn Error + Send + Sync>> {
        let mut acc = [0u32; 8];
        for (i, byte) in text.bytes().enumerate() {
            acc[i % 8] = acc[i % 8].wrapping_add(byte as u32);
        }
        Ok(acc.iter().map(|v| (*v % 1000) as f32 / 1000.0).collect())
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.token_usage)
    }
}
