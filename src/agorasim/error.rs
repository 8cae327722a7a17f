//! Kernel error taxonomy.
//!
//! Every fallible kernel operation returns [`SimError`]. The variants map to
//! the recovery policies the kernel applies:
//!
//! - [`SimError::Config`]: a scenario failed construction-time validation.
//!   Fatal for the spec; no branch is ever created from it.
//! - [`SimError::Grammar`]: an LM response was rejected by the validator.
//!   Recovered locally (one re-prompt, then a skipped turn); never fails a
//!   branch. Surfaces in results only when callers inspect skip reasons.
//! - [`SimError::LlmCall`]: transport/timeout/rate-limit failure talking to
//!   the LM service after the retry budget was exhausted.
//! - [`SimError::BranchContention`]: an attempt to mutate or run a node
//!   that is already running. Reported immediately, no side effects.
//! - [`SimError::System`]: unrecoverable failure (serialisation bug,
//!   poisoned lock). Sets the branch status to `failed`.

use std::error::Error;
use std::fmt;

/// Error type shared by all kernel operations.
#[derive(Debug, Clone)]
pub enum SimError {
    /// Scenario specification rejected at construction.
    Config(String),
    /// LM output rejected by the action validator.
    Grammar(String),
    /// LM transport failure that survived the retry budget.
    LlmCall(String),
    /// Structural or run operation attempted on a busy node.
    BranchContention(String),
    /// Unrecoverable internal failure.
    System(String),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::Config(msg) => write!(f, "invalid scenario: {}", msg),
            SimError::Grammar(msg) => write!(f, "grammar violation: {}", msg),
            SimError::LlmCall(msg) => write!(f, "LM call failed: {}", msg),
            SimError::BranchContention(msg) => write!(f, "branch contention: {}", msg),
            SimError::System(msg) => write!(f, "system failure: {}", msg),
        }
    }
}

impl Error for SimError {}

impl SimError {
    /// Wrap a serialisation error as a [`SimError::System`].
    pub fn from_serde(err: serde_json::Error) -> Self {
        SimError::System(format!("serialisation: {}", err))
    }
}
