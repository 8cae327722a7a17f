//! Bounded, cancellable execution of LM calls.
//!
//! Every LM call the kernel makes is a blocking operation with a deadline,
//! so calls are funnelled through an [`LmPool`]: a `tokio` semaphore capping
//! concurrency at `min(agents, worker_cap)`, with cooperative cancellation
//! that propagates into in-flight calls.
//!
//! Cancellation uses a watch-channel pair: the runner holds a
//! [`CancelSource`], every job holds a cloned [`CancelToken`]. Cancelling a
//! run flips the flag once; all pending and in-flight calls observe it at
//! their next await point and resolve to [`CallFailure::Cancelled`], which
//! the turn pipeline converts into a skipped turn that leaves the agent
//! untouched.
//!
//! Transport failures are retried with exponential backoff up to the
//! configured attempt budget; exhaustion resolves to
//! [`CallFailure::Unavailable`] (surfaced as a `llm_unavailable` skip).

use crate::client_wrapper::{ChatOptions, LlmClient, Message};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::time::Duration;

/// Cancellation authority held by whoever owns a run.
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

/// Cheap clonable token observed by jobs.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelSource {
    /// Create a source and its first token.
    pub fn new() -> (CancelSource, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelSource { tx }, CancelToken { rx })
    }

    /// Flip the flag. Idempotent.
    pub fn cancel(&self) {
        // Receivers may all be gone already; that is fine.
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    /// A token that never fires, for callers without a cancellation story.
    pub fn never() -> CancelToken {
        // Dropping the sender immediately is fine: `borrow` keeps returning
        // `false` and `cancelled` pends forever.
        let (_tx, rx) = watch::channel(false);
        CancelToken { rx }
    }

    /// Has the source been cancelled?
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is observed. Pends forever if the source
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                futures_util::future::pending::<()>().await;
            }
        }
    }
}

/// Why an LM job did not produce text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    /// The run was cancelled while the call was pending or in flight.
    Cancelled,
    /// The transport kept failing beyond the attempt budget.
    Unavailable(String),
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFailure::Cancelled => write!(f, "LM call cancelled"),
            CallFailure::Unavailable(msg) => write!(f, "LM unavailable: {}", msg),
        }
    }
}

/// Bounded worker pool for LM calls.
#[derive(Clone)]
pub struct LmPool {
    semaphore: Arc<Semaphore>,
}

impl LmPool {
    /// Pool with a fixed concurrency cap.
    pub fn new(cap: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(cap.max(1))),
        }
    }

    /// Pool sized `min(agents, worker_cap)` for one round.
    pub fn for_round(agents: usize, worker_cap: usize) -> Self {
        Self::new(agents.min(worker_cap).max(1))
    }

    /// Execute one LM call under the pool's concurrency cap, with retry,
    /// exponential backoff, and cooperative cancellation.
    ///
    /// `attempts` counts the initial call plus retries. The per-call
    /// deadline rides in `options.deadline`; it is enforced here as well so
    /// clients that cannot honour deadlines internally are still bounded.
    pub async fn call_with_retry(
        &self,
        client: Arc<dyn LlmClient>,
        messages: Vec<Message>,
        options: ChatOptions,
        attempts: u32,
        backoff_base: Duration,
        mut cancel: CancelToken,
    ) -> Result<String, CallFailure> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CallFailure::Cancelled),
            permit = self.semaphore.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err(CallFailure::Unavailable("LM pool closed".into())),
            },
        };

        let attempts = attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                // Exponential backoff between attempts, raced against
                // cancellation.
                let delay = backoff_base * 2u32.saturating_pow(attempt - 2);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(CallFailure::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                if log::log_enabled!(log::Level::Debug) {
                    log::debug!(
                        "retrying LM call against {} (attempt {}/{})",
                        client.model_name(),
                        attempt,
                        attempts
                    );
                }
            }

            let call = client.chat(&messages, &options);
            let bounded = async {
                match options.deadline {
                    Some(deadline) => match tokio::time::timeout(deadline, call).await {
                        Ok(result) => result,
                        Err(_) => Err(format!("deadline of {:?} exceeded", deadline).into()),
                    },
                    None => call.await,
                }
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CallFailure::Cancelled),
                result = bounded => result,
            };

            match result {
                Ok(text) => return Ok(text),
                Err(err) => {
                    last_error = err.to_string();
                    log::warn!(
                        "LM call against {} failed (attempt {}/{}): {}",
                        client.model_name(),
                        attempt,
                        attempts,
                        last_error
                    );
                }
            }
        }

        Err(CallFailure::Unavailable(last_error))
    }
}
