use agorasim::event_log::{EventLog, EventType};
use serde_json::json;

fn action(log: &mut EventLog, turn: u32, agent: &str, value: &str) -> u64 {
    log.append(
        turn,
        EventType::AgentAction,
        Some(agent.to_string()),
        None,
        json!({"summary": format!("{} chose {}", agent, value), "values": {"action": value}}),
    )
}

#[test]
fn test_seq_is_monotonic_and_gap_free() {
    let mut log = EventLog::new();
    for i in 0..20 {
        let seq = action(&mut log, 1 + i / 5, "Alice", "cooperate");
        assert_eq!(seq, i as u64);
    }
    let seqs: Vec<u64> = log.entries().iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (0..20).collect::<Vec<u64>>());
}

#[test]
fn test_range_returns_contiguous_slice() {
    let mut log = EventLog::new();
    for _ in 0..10 {
        action(&mut log, 1, "Alice", "cooperate");
    }
    let slice = log.range(3, 7);
    assert_eq!(slice.len(), 4);
    assert_eq!(slice[0].seq, 3);
    assert_eq!(slice[3].seq, 6);
}

#[test]
fn test_prune_rewinds_sequence_counter() {
    let mut log = EventLog::new();
    for _ in 0..6 {
        action(&mut log, 1, "Alice", "cooperate");
    }
    log.prune_from(4);
    assert_eq!(log.len(), 4);
    assert_eq!(log.next_seq(), 4);

    // The log stays gap-free after pruning.
    let seq = action(&mut log, 2, "Bob", "defect");
    assert_eq!(seq, 4);
}

#[test]
fn test_round_entries_filters_by_turn() {
    let mut log = EventLog::new();
    action(&mut log, 1, "Alice", "cooperate");
    action(&mut log, 1, "Bob", "defect");
    action(&mut log, 2, "Alice", "defect");
    assert_eq!(log.round_entries(1).len(), 2);
    assert_eq!(log.round_entries(2).len(), 1);
}

#[test]
fn test_align_with_itself_is_empty() {
    let mut log = EventLog::new();
    action(&mut log, 1, "Alice", "cooperate");
    action(&mut log, 1, "Bob", "defect");
    action(&mut log, 2, "Alice", "defect");

    let diff = log.align(&log, 3);
    assert!(diff.added.is_empty());
    assert!(diff.removed.is_empty());
    assert!(diff.is_empty());
}

#[test]
fn test_align_reports_added_and_removed() {
    // a: m n o   b: m o p  ->  removed n, added p
    let mut a = EventLog::new();
    action(&mut a, 1, "Alice", "m");
    action(&mut a, 1, "Bob", "n");
    action(&mut a, 2, "Alice", "o");

    let mut b = EventLog::new();
    action(&mut b, 1, "Alice", "m");
    action(&mut b, 2, "Alice", "o");
    action(&mut b, 2, "Bob", "p");

    let diff = a.align(&b, 3);
    assert_eq!(diff.removed.len(), 1);
    assert_eq!(diff.added.len(), 1);
    assert_eq!(diff.removed[0].payload["values"]["action"], "n");
    assert_eq!(diff.added[0].payload["values"]["action"], "p");
    assert!(!diff.evidence_segments.is_empty());
}

#[test]
fn test_align_ignores_wall_clock_payload_fields() {
    let mut a = EventLog::new();
    a.append(
        1,
        EventType::AgentAction,
        Some("Alice".to_string()),
        None,
        json!({"values": {"action": "cooperate"}, "time": 1080}),
    );
    let mut b = EventLog::new();
    b.append(
        1,
        EventType::AgentAction,
        Some("Alice".to_string()),
        None,
        json!({"values": {"action": "cooperate"}, "time": 1095}),
    );
    assert!(a.align(&b, 3).is_empty());
}

#[test]
fn test_align_caps_evidence_segments() {
    let mut a = EventLog::new();
    let mut b = EventLog::new();
    // Five divergent regions separated by shared anchors.
    for i in 0..5 {
        action(&mut a, i, "Anchor", &format!("shared-{}", i));
        action(&mut b, i, "Anchor", &format!("shared-{}", i));
        action(&mut a, i, "Alice", &format!("left-{}", i));
        action(&mut b, i, "Bob", &format!("right-{}", i));
    }
    let diff = a.align(&b, 2);
    assert_eq!(diff.removed.len(), 5);
    assert_eq!(diff.added.len(), 5);
    assert_eq!(diff.evidence_segments.len(), 2);
}

#[tokio::test]
async fn test_stream_from_replays_then_tails() {
    let mut log = EventLog::new();
    action(&mut log, 1, "Alice", "cooperate");
    action(&mut log, 1, "Bob", "defect");

    let mut rx = log.stream_from(1);

    // Replay: only entries with seq >= 1.
    let first = rx.recv().await.unwrap();
    assert_eq!(first.seq, 1);

    // Live tail.
    action(&mut log, 2, "Alice", "defect");
    let live = rx.recv().await.unwrap();
    assert_eq!(live.seq, 2);
    assert_eq!(live.sender.as_deref(), Some("Alice"));
}

#[test]
fn test_dropped_subscriber_is_pruned_on_next_append() {
    let mut log = EventLog::new();
    let rx = log.stream_from(0);
    drop(rx);
    // Append after the receiver is gone must not fail.
    let seq = action(&mut log, 1, "Alice", "cooperate");
    assert_eq!(seq, 0);
}

#[test]
fn test_entries_round_trip_through_json() {
    let mut log = EventLog::new();
    action(&mut log, 1, "Alice", "cooperate");
    log.append(
        1,
        EventType::SystemBroadcast,
        Some("Alice".to_string()),
        Some(vec!["Bob".to_string()]),
        json!({"message": "hi", "recipients": ["Bob"]}),
    );

    let json = serde_json::to_string(&log).unwrap();
    let restored: EventLog = serde_json::from_str(&json).unwrap();
    assert_eq!(log, restored);
    assert_eq!(restored.next_seq(), 2);
}
