//! Kernel configuration.
//!
//! Provides the [`KernelConfig`] struct consumed by the round runner, the LM
//! job pool, and the simulation tree. Users construct it manually; no file
//! parsing dependencies are required.
//!
//! # Example
//!
//! ```rust
//! use agorasim::config::KernelConfig;
//! use std::time::Duration;
//!
//! // Use the defaults (60s per LM call, 3 attempts, 8 workers)
//! let config = KernelConfig::default();
//!
//! // Or tighten the deadlines for a local model
//! let config = KernelConfig {
//!     llm_call_timeout: Duration::from_secs(20),
//!     worker_cap: 4,
//!     ..KernelConfig::default()
//! };
//! ```

use std::time::Duration;

/// Tunables for one kernel instance.
///
/// The struct is intentionally minimal and users construct it however they
/// want. No TOML, YAML, or other config-file parsing dependencies are
/// introduced.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Deadline applied to every individual LM call.
    pub llm_call_timeout: Duration,
    /// Total attempts per LM call (1 initial + retries) before the turn is
    /// skipped with reason `llm_unavailable`.
    pub llm_attempts: u32,
    /// Base delay for exponential backoff between LM retry attempts.
    pub backoff_base: Duration,
    /// Upper bound on concurrent LM calls within one simultaneous round.
    /// The effective pool size is `min(agents, worker_cap)`.
    pub worker_cap: usize,
    /// Fallback character cap for rolling summaries when a scenario does
    /// not declare its own `summary_threshold`.
    pub default_summary_threshold: usize,
    /// Turn interval at which environment-event suggestions become
    /// available on a branch.
    pub suggestion_interval: u32,
    /// Cap on environment-event suggestions generated per request.
    pub max_suggestions: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            llm_call_timeout: Duration::from_secs(60),
            llm_attempts: 3,
            backoff_base: Duration::from_millis(250),
            worker_cap: 8,
            default_summary_threshold: 1000,
            suggestion_interval: 5,
            max_suggestions: 3,
        }
    }
}
