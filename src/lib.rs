// src/lib.rs

// Import the top-level `agorasim` module.
pub mod agorasim;

// Re-export the submodules at the crate root so callers (and the crate's own
// internals) can use `agorasim::sim_tree::...` instead of the full hierarchy.
pub use agorasim::{
    agent_state, client_wrapper, clients, config, environment, error, event_log, lm_pool,
    mechanics, observer, presets, prompt, round, scenario, sim_tree, snapshot, summarizer, turn,
    validator, variants,
};

// Re-exporting key items for easier external access.
pub use agorasim::client_wrapper::{ChatOptions, LlmBindings, LlmClient, Message, Role};
pub use agorasim::config::KernelConfig;
pub use agorasim::error::SimError;
pub use agorasim::scenario::{ActionGrammar, ScenarioSpec, Visibility};
pub use agorasim::sim_tree::{SimulationTree, SIM_TREE_REGISTRY};
