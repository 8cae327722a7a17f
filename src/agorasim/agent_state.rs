//! Per-agent mutable state: demographics, short memory, rolling summary.
//!
//! An [`AgentState`] is uniquely named within a simulation. It is created at
//! simulation init or inherited by fork, mutated only by the turn pipeline
//! and the context summariser running on its owning branch, and destroyed
//! when its branch is evicted.
//!
//! Short memory is an ordered list of `(role, content, media)` entries.
//! Adjacent same-role plain-text entries are merged with a newline; entries
//! carrying media references are never merged, so multimodal context is not
//! silently flattened away.

use crate::client_wrapper::{Message, Role};
use crate::scenario::ScenarioSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// References to media attached to a memory entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaRefs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub video: Vec<String>,
}

impl MediaRefs {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.audio.is_empty() && self.video.is_empty()
    }

    pub fn images(urls: Vec<String>) -> Self {
        Self {
            images: urls,
            ..Self::default()
        }
    }
}

/// One entry of an agent's short memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub role: MemoryRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "MediaRefs::is_empty")]
    pub media: MediaRefs,
}

/// Role of a memory entry. Mirrors the chat roles the LM consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryRole {
    System,
    User,
    Assistant,
}

impl MemoryRole {
    fn as_chat_role(self) -> Role {
        match self {
            MemoryRole::System => Role::System,
            MemoryRole::User => Role::User,
            MemoryRole::Assistant => Role::Assistant,
        }
    }
}

/// Ordered short-term memory with adjacency merging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShortMemory {
    entries: Vec<MemoryEntry>,
}

impl ShortMemory {
    /// Append an entry. Merges into the previous entry when both are plain
    /// text with the same role; entries carrying media never merge.
    pub fn append(&mut self, role: MemoryRole, content: impl Into<String>, media: MediaRefs) {
        let content = content.into();
        if media.is_empty() {
            if let Some(last) = self.entries.last_mut() {
                if last.role == role && last.media.is_empty() {
                    last.content.push('\n');
                    last.content.push_str(&content);
                    return;
                }
            }
        }
        self.entries.push(MemoryEntry {
            role,
            content,
            media,
        });
    }

    pub fn entries(&self) -> &[MemoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Mutable per-agent record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Unique within a simulation.
    pub name: String,
    /// Typed key-value demographics: role, traits, coordinates, inventory.
    /// Ordered so rendered prompts are deterministic.
    pub properties: BTreeMap<String, serde_json::Value>,
    pub short_memory: ShortMemory,
    /// Natural-language digest of everything this agent has observed so far,
    /// at most `summary_threshold` characters. Refreshed once per round by
    /// the context summariser.
    pub rolling_summary: String,
    /// Which LM client to use, resolved via
    /// [`LlmBindings`](crate::client_wrapper::LlmBindings).
    pub llm_binding: String,
}

impl AgentState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
            short_memory: ShortMemory::default(),
            rolling_summary: String::new(),
            llm_binding: "default".to_string(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Builder-style binding setter.
    pub fn with_llm_binding(mut self, binding: impl Into<String>) -> Self {
        self.llm_binding = binding.into();
        self
    }

    /// Append a memory entry with the merge semantics of [`ShortMemory`].
    pub fn append_memory(&mut self, role: MemoryRole, content: impl Into<String>, media: MediaRefs) {
        self.short_memory.append(role, content, media);
    }

    /// Record environment feedback (broadcasts, mechanic outcomes) as a
    /// user-role entry.
    pub fn inject_env_feedback(&mut self, text: impl Into<String>, media: MediaRefs) {
        self.short_memory.append(MemoryRole::User, text, media);
    }

    /// Render the message list the LM client will consume: a synthesised
    /// system message built from the rolling summary, the agent's
    /// properties, and the scenario rules, followed by the short-memory
    /// entries.
    pub fn render_context(&self, scenario: &ScenarioSpec) -> Vec<Message> {
        let mut system = format!("You are {}.", self.name);

        if !self.properties.is_empty() {
            system.push_str("\nYour profile:");
            for (key, value) in &self.properties {
                system.push_str(&format!("\n- {}: {}", key, render_property(value)));
            }
        }

        if !scenario.rules.is_empty() {
            system.push_str("\nBehavioural rules:");
            for rule in &scenario.rules {
                system.push_str(&format!("\n- {}", rule));
            }
        }

        if !self.rolling_summary.is_empty() {
            system.push_str("\nWhat you have observed so far: ");
            system.push_str(&self.rolling_summary);
        }

        let mut messages = vec![Message::new(Role::System, &system)];
        for entry in self.short_memory.entries() {
            messages.push(Message::new(entry.role.as_chat_role(), &entry.content));
        }
        messages
    }
}

fn render_property(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
