//! Append-only per-branch event log.
//!
//! Every observable event in a branch lands here: agent actions, chat,
//! broadcasts, environment events, suggestion dismissals, snapshot markers.
//! Entries carry a monotonic, gap-free sequence number; once written they are
//! never mutated. There is exactly one logical writer per branch (the round
//! runner that owns the node), so the log itself needs no internal locking.
//!
//! Beyond append/range, the log supports:
//!
//! - [`EventLog::stream_from`]: replay from a sequence number plus a live
//!   tail, for subscribers such as the outer WebSocket surface.
//! - [`EventLog::align`]: an LCS edit script between two branches' logs,
//!   with evidence windows around each divergence. This is what variant
//!   comparison builds on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Kind of an event-log entry. The set is closed at the kernel boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SystemBroadcast,
    AgentAction,
    Chat,
    EnvironmentEvent,
    SuggestionDismissed,
    Snapshot,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SystemBroadcast => "system_broadcast",
            EventType::AgentAction => "agent_action",
            EventType::Chat => "chat",
            EventType::EnvironmentEvent => "environment_event",
            EventType::SuggestionDismissed => "suggestion_dismissed",
            EventType::Snapshot => "snapshot",
        }
    }
}

/// One immutable log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEntry {
    /// Monotonic within a branch, strictly increasing, no gaps.
    pub seq: u64,
    /// Round number the event belongs to (1-based; 0 for pre-run events).
    pub turn: u32,
    pub kind: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<String>>,
    /// Opaque structured data.
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Edit script between two logs, plus evidence context around each
/// divergence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDiff {
    /// Entries present in the other log but not in this one.
    pub added: Vec<EventEntry>,
    /// Entries present in this log but not in the other.
    pub removed: Vec<EventEntry>,
    /// Context windows around divergent regions, oldest first.
    pub evidence_segments: Vec<EvidenceSegment>,
}

impl LogDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// A window of surrounding context for one divergent region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceSegment {
    /// Index into the left log where the window starts.
    pub a_start: usize,
    /// Index into the right log where the window starts.
    pub b_start: usize,
    pub a_events: Vec<EventEntry>,
    pub b_events: Vec<EventEntry>,
}

/// Append-only FIFO keyed by monotonic sequence within a branch.
#[derive(Debug, Serialize, Deserialize)]
pub struct EventLog {
    entries: Vec<EventEntry>,
    next_seq: u64,
    #[serde(skip)]
    subscribers: Vec<mpsc::UnboundedSender<EventEntry>>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
            subscribers: Vec::new(),
        }
    }
}

// Subscribers are a property of one live branch; a deep-copied fork starts
// with none.
impl Clone for EventLog {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            next_seq: self.next_seq,
            subscribers: Vec::new(),
        }
    }
}

impl PartialEq for EventLog {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries && self.next_seq == other.next_seq
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from previously serialised entries (snapshot restore).
    /// The sequence counter resumes after the last entry.
    pub fn from_entries(entries: Vec<EventEntry>) -> Self {
        let next_seq = entries.last().map(|e| e.seq + 1).unwrap_or(0);
        Self {
            entries,
            next_seq,
            subscribers: Vec::new(),
        }
    }

    /// Append an event, assigning the next sequence number. Returns the
    /// assigned `seq`.
    pub fn append(
        &mut self,
        turn: u32,
        kind: EventType,
        sender: Option<String>,
        recipients: Option<Vec<String>>,
        payload: serde_json::Value,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = EventEntry {
            seq,
            turn,
            kind,
            sender,
            recipients,
            payload,
            timestamp: Utc::now(),
        };
        self.subscribers
            .retain(|tx| tx.send(entry.clone()).is_ok());
        self.entries.push(entry);
        seq
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[EventEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequence number the next append will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Contiguous slice of entries with `from <= seq < to`.
    pub fn range(&self, from: u64, to: u64) -> &[EventEntry] {
        let start = self.entries.partition_point(|e| e.seq < from);
        let end = self.entries.partition_point(|e| e.seq < to);
        &self.entries[start..end]
    }

    /// Entries belonging to one round.
    pub fn round_entries(&self, turn: u32) -> Vec<&EventEntry> {
        self.entries.iter().filter(|e| e.turn == turn).collect()
    }

    /// Subscribe from a sequence number: already-written entries with
    /// `seq >= from` are replayed immediately, then live appends follow.
    /// The subscription ends when the receiver is dropped.
    pub fn stream_from(&mut self, from: u64) -> mpsc::UnboundedReceiver<EventEntry> {
        let (tx, rx) = mpsc::unbounded_channel();
        for entry in self.entries.iter().filter(|e| e.seq >= from) {
            // A receiver dropped before replay finishes just ends the stream.
            if tx.send(entry.clone()).is_err() {
                return rx;
            }
        }
        self.subscribers.push(tx);
        rx
    }

    /// Drop all entries with `seq >= from` and rewind the sequence counter
    /// so the log stays gap-free. Used to roll back mid-round state before
    /// branching.
    pub fn prune_from(&mut self, from: u64) {
        self.entries.retain(|e| e.seq < from);
        self.next_seq = self.entries.last().map(|e| e.seq + 1).unwrap_or(0);
    }

    /// Compute an edit script between this log and `other` using LCS over
    /// `(kind, sender, stable payload)` alignment keys, returning entries
    /// added by `other`, entries removed from `self`, and up to
    /// `max_evidence` context windows around the divergent regions.
    ///
    /// `align(&l, &l)` is empty for any log `l`.
    pub fn align(&self, other: &EventLog, max_evidence: usize) -> LogDiff {
        let a_keys: Vec<String> = self.entries.iter().map(align_key).collect();
        let b_keys: Vec<String> = other.entries.iter().map(align_key).collect();

        let n = a_keys.len();
        let m = b_keys.len();

        // Standard LCS table. Branch logs are bounded by rounds × agents, so
        // the quadratic table stays small.
        let mut dp = vec![vec![0usize; m + 1]; n + 1];
        for i in (0..n).rev() {
            for j in (0..m).rev() {
                dp[i][j] = if a_keys[i] == b_keys[j] {
                    dp[i + 1][j + 1] + 1
                } else {
                    dp[i + 1][j].max(dp[i][j + 1])
                };
            }
        }

        #[derive(PartialEq)]
        enum Op {
            Keep,
            Removed(usize),
            Added(usize),
        }

        let mut ops = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < n && j < m {
            if a_keys[i] == b_keys[j] {
                ops.push(Op::Keep);
                i += 1;
                j += 1;
            } else if dp[i + 1][j] >= dp[i][j + 1] {
                ops.push(Op::Removed(i));
                i += 1;
            } else {
                ops.push(Op::Added(j));
                j += 1;
            }
        }
        while i < n {
            ops.push(Op::Removed(i));
            i += 1;
        }
        while j < m {
            ops.push(Op::Added(j));
            j += 1;
        }

        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut evidence_segments = Vec::new();

        // Walk the ops, collecting divergent runs and a ±2 window of context
        // around each.
        let mut run_start: Option<(usize, usize)> = None;
        let mut a_pos = 0usize;
        let mut b_pos = 0usize;
        for op in &ops {
            match op {
                Op::Keep => {
                    if let Some((a0, b0)) = run_start.take() {
                        if evidence_segments.len() < max_evidence {
                            evidence_segments.push(self.evidence_window(
                                other, a0, a_pos, b0, b_pos,
                            ));
                        }
                    }
                    a_pos += 1;
                    b_pos += 1;
                }
                Op::Removed(idx) => {
                    removed.push(self.entries[*idx].clone());
                    if run_start.is_none() {
                        run_start = Some((a_pos, b_pos));
                    }
                    a_pos += 1;
                }
                Op::Added(idx) => {
                    added.push(other.entries[*idx].clone());
                    if run_start.is_none() {
                        run_start = Some((a_pos, b_pos));
                    }
                    b_pos += 1;
                }
            }
        }
        if let Some((a0, b0)) = run_start {
            if evidence_segments.len() < max_evidence {
                evidence_segments.push(self.evidence_window(other, a0, a_pos, b0, b_pos));
            }
        }

        LogDiff {
            added,
            removed,
            evidence_segments,
        }
    }

    fn evidence_window(
        &self,
        other: &EventLog,
        a_from: usize,
        a_to: usize,
        b_from: usize,
        b_to: usize,
    ) -> EvidenceSegment {
        const CONTEXT: usize = 2;
        let a_start = a_from.saturating_sub(CONTEXT);
        let a_end = (a_to + CONTEXT).min(self.entries.len());
        let b_start = b_from.saturating_sub(CONTEXT);
        let b_end = (b_to + CONTEXT).min(other.entries.len());
        EvidenceSegment {
            a_start,
            b_start,
            a_events: self.entries[a_start..a_end].to_vec(),
            b_events: other.entries[b_start..b_end].to_vec(),
        }
    }
}

/// Alignment key: the event's kind, sender, and payload with volatile keys
/// (wall-clock fields) removed. Sequence numbers and timestamps are
/// deliberately excluded so structurally equal histories align even when
/// they were recorded at different times.
fn align_key(entry: &EventEntry) -> String {
    let mut payload = entry.payload.clone();
    if let serde_json::Value::Object(map) = &mut payload {
        map.remove("time");
        map.remove("timestamp");
    }
    format!(
        "{}|{}|{}",
        entry.kind.as_str(),
        entry.sender.as_deref().unwrap_or(""),
        payload
    )
}
