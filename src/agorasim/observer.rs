//! Callback-based observability for runs and variant execution.
//!
//! Implement [`SimObserver`] to receive real-time notifications about round
//! boundaries, per-agent outcomes, run completion, and variant progress. The
//! outer service layer (the excluded WebSocket surface) subscribes here
//! instead of polling branch state.
//!
//! Both methods have **default no-op implementations**, so you only override
//! what you care about. The handler is wrapped in `Arc<dyn SimObserver>` and
//! shared across the round runner and the variant executor.
//!
//! # Example
//!
//! ```rust,no_run
//! use agorasim::observer::{SimObserver, VariantProgress};
//! use async_trait::async_trait;
//!
//! struct Progress;
//!
//! #[async_trait]
//! impl SimObserver for Progress {
//!     async fn on_variant_progress(&self, progress: &VariantProgress) {
//!         println!(
//!             "{} (node {}) finished {} rounds: {:?}",
//!             progress.name, progress.node_id, progress.turns_completed, progress.status
//!         );
//!     }
//! }
//! ```

use crate::sim_tree::NodeStatus;
use crate::turn::ActionOutcome;
use async_trait::async_trait;

/// Progress report published as each variant's run completes.
#[derive(Debug, Clone)]
pub struct VariantProgress {
    /// Variant name as supplied to the executor.
    pub name: String,
    /// Node the variant ran on.
    pub node_id: u64,
    /// Fully-completed rounds at the time of the report.
    pub turns_completed: u32,
    /// Node status after the run.
    pub status: NodeStatus,
}

/// Trait for receiving kernel progress events.
#[async_trait]
pub trait SimObserver: Send + Sync {
    /// A round is beginning on a node.
    async fn on_round_started(&self, _node_id: u64, _round: u32) {}

    /// A round finished (or was aborted mid-way by cancellation).
    async fn on_round_completed(&self, _node_id: u64, _round: u32, _aborted: bool) {}

    /// One agent's turn was recorded.
    async fn on_agent_acted(
        &self,
        _node_id: u64,
        _round: u32,
        _agent: &str,
        _outcome: &ActionOutcome,
    ) {
    }

    /// A `run` call finished, successfully or not.
    async fn on_run_completed(&self, _node_id: u64, _turns_completed: u32, _status: NodeStatus) {}

    /// A variant submitted through the variant executor completed.
    async fn on_variant_progress(&self, _progress: &VariantProgress) {}
}

/// Observer that ignores everything. Useful as a default.
pub struct NullObserver;

#[async_trait]
impl SimObserver for NullObserver {}
