//! Scenario specifications and the typed action grammar.
//!
//! A [`ScenarioSpec`] is the immutable, serialisable template a simulation is
//! built from: what the world is about, which actions agents may take
//! ([`ActionGrammar`]), how agents see each other within a round
//! ([`Visibility`]), which mechanics run ([`MechanicConfig`]), behavioural
//! rules injected into prompts, and an optional directed network topology
//! that scopes broadcasts.
//!
//! The grammar is the contract between the LM and the kernel, so it is a sum
//! type rather than an untyped map; downstream code (prompt builder,
//! validator, mechanics) dispatches on the constructor:
//!
//! - [`ActionGrammar::Discrete`]: an ordered set of allowed action names.
//!   Matching is case-insensitive with substring tolerance.
//! - [`ActionGrammar::Integer`]: an inclusive `[min, max]` range. Values
//!   outside the range are clamped, never rejected.
//! - [`ActionGrammar::Freeform`]: a schema of named parameters with
//!   required flags, collected alongside the chosen action.
//!
//! # Example
//!
//! ```rust
//! use agorasim::scenario::{ActionGrammar, ScenarioSpec, Visibility};
//!
//! let spec = ScenarioSpec::builder("pd", "Prisoner's Dilemma")
//!     .description("Two suspects are arrested and held separately.")
//!     .grammar(ActionGrammar::discrete("action", &["cooperate", "defect"]))
//!     .visibility(Visibility::Simultaneous)
//!     .max_rounds(10)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(spec.grammar.output_field(), "action");
//! ```
//!
//! *Invariant:* a `ScenarioSpec` is frozen once attached to a simulation; it
//! never mutates, only new specs supersede it via branching.

use crate::error::SimError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

/// How agents see each other's choices within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// All agents decide from the same pre-round snapshot; nobody sees a
    /// same-round action.
    Simultaneous,
    /// Agents decide one at a time in declared order, each seeing the
    /// current round so far.
    Sequential,
}

/// A named parameter of a freeform action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    /// Surfaced to the LM in prompts and re-prompts.
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
        }
    }
}

/// The typed schema constraining what actions an agent may take.
///
/// Each constructor carries the declared output-field name, the JSON key
/// the LM must populate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionGrammar {
    /// An ordered set of allowed action names.
    Discrete {
        output_field: String,
        actions: Vec<String>,
    },
    /// An inclusive integer range.
    Integer {
        output_field: String,
        min: i64,
        max: i64,
    },
    /// A schema of named parameters accompanying the chosen action.
    Freeform {
        output_field: String,
        params: Vec<ParamSpec>,
    },
}

impl ActionGrammar {
    /// Discrete grammar over the given action names.
    pub fn discrete(output_field: &str, actions: &[&str]) -> Self {
        ActionGrammar::Discrete {
            output_field: output_field.to_string(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Integer grammar over the inclusive `[min, max]` range.
    pub fn integer(output_field: &str, min: i64, max: i64) -> Self {
        ActionGrammar::Integer {
            output_field: output_field.to_string(),
            min,
            max,
        }
    }

    /// Freeform grammar over the given parameter schema.
    pub fn freeform(output_field: &str, params: Vec<ParamSpec>) -> Self {
        ActionGrammar::Freeform {
            output_field: output_field.to_string(),
            params,
        }
    }

    /// The declared output-field name.
    pub fn output_field(&self) -> &str {
        match self {
            ActionGrammar::Discrete { output_field, .. } => output_field,
            ActionGrammar::Integer { output_field, .. } => output_field,
            ActionGrammar::Freeform { output_field, .. } => output_field,
        }
    }

    /// Construction-time validation. Called by [`ScenarioSpec::validate`].
    pub fn validate(&self) -> Result<(), SimError> {
        if self.output_field().trim().is_empty() {
            return Err(SimError::Config("grammar output field is blank".into()));
        }
        match self {
            ActionGrammar::Discrete { actions, .. } => {
                if actions.is_empty() {
                    return Err(SimError::Config(
                        "discrete grammar declares an empty action set".into(),
                    ));
                }
                if actions.iter().any(|a| a.trim().is_empty()) {
                    return Err(SimError::Config(
                        "discrete grammar contains a blank action name".into(),
                    ));
                }
            }
            ActionGrammar::Integer { min, max, .. } => {
                if min > max {
                    return Err(SimError::Config(format!(
                        "integer grammar range is inverted: [{}, {}]",
                        min, max
                    )));
                }
            }
            ActionGrammar::Freeform { params, .. } => {
                if params.is_empty() {
                    return Err(SimError::Config(
                        "freeform grammar declares no parameters".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Build the JSON schema for constrained decoding from a grammar.
///
/// The schema enforces output structure at the provider level:
/// - a `reasoning` string field for the model's thinking, decoupled from the
///   output value;
/// - the output field with enum constraints for discrete actions, as an
///   integer for numeric actions, or as typed string parameters for
///   freeform actions;
/// - a `required` list naming the output field (and required parameters).
///
/// # Example
///
/// ```rust
/// use agorasim::scenario::{build_schema, ActionGrammar};
///
/// let schema = build_schema(&ActionGrammar::discrete("action", &["cooperate", "defect"]));
/// assert_eq!(schema["properties"]["action"]["enum"][0], "cooperate");
/// assert_eq!(schema["required"][0], "action");
/// ```
pub fn build_schema(grammar: &ActionGrammar) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    properties.insert("reasoning".to_string(), json!({"type": "string"}));

    let mut required = vec![grammar.output_field().to_string()];

    match grammar {
        ActionGrammar::Discrete {
            output_field,
            actions,
        } => {
            properties.insert(
                output_field.clone(),
                json!({"type": "string", "enum": actions}),
            );
        }
        ActionGrammar::Integer { output_field, .. } => {
            properties.insert(output_field.clone(), json!({"type": "integer"}));
        }
        ActionGrammar::Freeform {
            output_field,
            params,
        } => {
            properties.insert(output_field.clone(), json!({"type": "string"}));
            for param in params {
                properties.insert(
                    param.name.clone(),
                    json!({"type": "string", "description": param.description}),
                );
                if param.required {
                    required.push(param.name.clone());
                }
            }
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Configuration for one mechanic attached to a scenario.
///
/// Mechanics are modular interaction patterns layered on top of the action
/// grammar; each descriptor carries its own config and the runtime side
/// effects live in [`crate::mechanics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MechanicConfig {
    /// Agents positioned on a bounded grid, moving one cell per action.
    Grid {
        width: i64,
        height: i64,
    },
    /// Proposal-based voting with a pass threshold.
    Voting {
        /// Fraction of yes votes needed to pass.
        #[serde(default = "default_vote_threshold")]
        threshold: f64,
        /// Turns before a proposal expires.
        #[serde(default = "default_vote_timeout")]
        timeout_turns: u32,
        #[serde(default = "default_true")]
        allow_abstain: bool,
    },
    /// Per-agent integer inventories with transfers.
    Resources {
        /// Starting inventory granted to every agent.
        #[serde(default)]
        initial: BTreeMap<String, i64>,
    },
    /// Ranked roles gating who may address whom.
    Hierarchy {
        /// Role names from most to least senior.
        levels: Vec<String>,
    },
    /// Free discussion: message broadcast each turn.
    Discussion {
        /// Cap on messages one agent may send per turn.
        #[serde(default = "default_messages_per_turn")]
        max_messages_per_turn: u32,
    },
}

fn default_vote_threshold() -> f64 {
    0.5
}

fn default_vote_timeout() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_messages_per_turn() -> u32 {
    1
}

impl MechanicConfig {
    /// Stable identifier used in event payloads and scene state keys.
    pub fn kind(&self) -> &'static str {
        match self {
            MechanicConfig::Grid { .. } => "grid",
            MechanicConfig::Voting { .. } => "voting",
            MechanicConfig::Resources { .. } => "resources",
            MechanicConfig::Hierarchy { .. } => "hierarchy",
            MechanicConfig::Discussion { .. } => "discussion",
        }
    }

    fn validate(&self) -> Result<(), SimError> {
        match self {
            MechanicConfig::Grid { width, height } => {
                if *width <= 0 || *height <= 0 {
                    return Err(SimError::Config(format!(
                        "grid mechanic dimensions must be positive, got {}x{}",
                        width, height
                    )));
                }
            }
            MechanicConfig::Voting { threshold, .. } => {
                if !(0.0..=1.0).contains(threshold) {
                    return Err(SimError::Config(format!(
                        "voting threshold must be within [0, 1], got {}",
                        threshold
                    )));
                }
            }
            MechanicConfig::Hierarchy { levels } => {
                if levels.is_empty() {
                    return Err(SimError::Config(
                        "hierarchy mechanic declares no levels".into(),
                    ));
                }
            }
            MechanicConfig::Resources { .. } | MechanicConfig::Discussion { .. } => {}
        }
        Ok(())
    }
}

/// Directed adjacency: sender name → reachable recipient names.
pub type NetworkTopology = BTreeMap<String, Vec<String>>;

/// Immutable scenario template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSpec {
    pub id: String,
    pub name: String,
    /// Free text injected into every agent prompt.
    pub description: String,
    pub grammar: ActionGrammar,
    pub visibility: Visibility,
    /// Ordered mechanic descriptors. Order matters: side effects apply in
    /// declaration order after each turn.
    #[serde(default)]
    pub mechanics: Vec<MechanicConfig>,
    /// Free-text behavioural rules injected into prompts.
    #[serde(default)]
    pub rules: Vec<String>,
    /// Optional directed adjacency enforced on broadcasts.
    #[serde(default)]
    pub network_topology: Option<NetworkTopology>,
    pub max_rounds: u32,
    /// Character cap for per-agent rolling summaries.
    pub summary_threshold: usize,
    /// Scene-clock minutes advanced per agent turn.
    #[serde(default = "default_minutes_per_turn")]
    pub minutes_per_turn: u32,
}

fn default_minutes_per_turn() -> u32 {
    3
}

impl ScenarioSpec {
    /// Start building a spec. The builder applies defaults (simultaneous
    /// visibility, 10 rounds, 1000-char summaries) and validates on
    /// [`ScenarioSpecBuilder::build`].
    pub fn builder(id: impl Into<String>, name: impl Into<String>) -> ScenarioSpecBuilder {
        ScenarioSpecBuilder {
            spec: ScenarioSpec {
                id: id.into(),
                name: name.into(),
                description: String::new(),
                grammar: ActionGrammar::discrete("action", &["continue"]),
                visibility: Visibility::Simultaneous,
                mechanics: Vec::new(),
                rules: Vec::new(),
                network_topology: None,
                max_rounds: 10,
                summary_threshold: 1000,
                minutes_per_turn: default_minutes_per_turn(),
            },
        }
    }

    /// Validate the whole spec. Detected at construction; fatal for the
    /// spec: no branch is ever created from an invalid one.
    pub fn validate(&self) -> Result<(), SimError> {
        if self.id.trim().is_empty() {
            return Err(SimError::Config("scenario id is blank".into()));
        }
        if self.max_rounds == 0 {
            return Err(SimError::Config("max_rounds must be at least 1".into()));
        }
        if self.summary_threshold == 0 {
            return Err(SimError::Config("summary_threshold must be positive".into()));
        }
        self.grammar.validate()?;
        for mechanic in &self.mechanics {
            mechanic.validate()?;
        }
        if let Some(topology) = &self.network_topology {
            for (sender, recipients) in topology {
                if recipients.iter().any(|r| r == sender) {
                    return Err(SimError::Config(format!(
                        "network topology lists '{}' as its own recipient",
                        sender
                    )));
                }
            }
        }
        Ok(())
    }

    /// Effective broadcast recipients for `sender`, intersected with the
    /// agents actually present in the scene. Absent topology implies full
    /// broadcast to everyone but the sender.
    pub fn recipients_for(&self, sender: &str, agents_in_scene: &[String]) -> Vec<String> {
        match &self.network_topology {
            Some(topology) => {
                let connections = topology.get(sender).cloned().unwrap_or_default();
                agents_in_scene
                    .iter()
                    .filter(|name| *name != sender && connections.iter().any(|c| c == *name))
                    .cloned()
                    .collect()
            }
            None => agents_in_scene
                .iter()
                .filter(|name| *name != sender)
                .cloned()
                .collect(),
        }
    }
}

/// Builder returned by [`ScenarioSpec::builder`].
pub struct ScenarioSpecBuilder {
    spec: ScenarioSpec,
}

impl ScenarioSpecBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.spec.description = description.into();
        self
    }

    pub fn grammar(mut self, grammar: ActionGrammar) -> Self {
        self.spec.grammar = grammar;
        self
    }

    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.spec.visibility = visibility;
        self
    }

    pub fn mechanic(mut self, mechanic: MechanicConfig) -> Self {
        self.spec.mechanics.push(mechanic);
        self
    }

    pub fn rule(mut self, rule: impl Into<String>) -> Self {
        self.spec.rules.push(rule.into());
        self
    }

    pub fn network_topology(mut self, topology: NetworkTopology) -> Self {
        self.spec.network_topology = Some(topology);
        self
    }

    pub fn max_rounds(mut self, max_rounds: u32) -> Self {
        self.spec.max_rounds = max_rounds;
        self
    }

    pub fn summary_threshold(mut self, summary_threshold: usize) -> Self {
        self.spec.summary_threshold = summary_threshold;
        self
    }

    pub fn minutes_per_turn(mut self, minutes: u32) -> Self {
        self.spec.minutes_per_turn = minutes;
        self
    }

    /// Validate and freeze the spec.
    pub fn build(self) -> Result<ScenarioSpec, SimError> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}
