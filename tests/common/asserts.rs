#![allow(dead_code)]

use std::sync::Arc;

use mentat_orchestrator::event_log::Event;
use mentat_orchestrator::types::{EventKind, NodeStatus, RunStatus};

/// A compact, comparable label for an event, e.g. `node_status(a,running)`.
pub fn label(event: &Event) -> String {
    match event.kind {
        EventKind::Status => format!(
            "status({})",
            event.run_status().map_or_else(|| "?".into(), |s| s.to_string())
        ),
        EventKind::NodeStatus => format!(
            "node_status({},{})",
            event.node_id().unwrap_or("?"),
            event
                .node_status()
                .map_or_else(|| "?".into(), |s| s.to_string())
        ),
        other => other.to_string(),
    }
}

/// Assert `expected` appears as an ordered subsequence of the stream's
/// labels.
pub fn assert_subsequence(events: &[Arc<Event>], expected: &[&str]) {
    let labels: Vec<String> = events.iter().map(|e| label(e)).collect();
    let mut expected_iter = expected.iter();
    let mut looking_for = expected_iter.next();
    for actual in &labels {
        if let Some(want) = looking_for {
            if actual == want {
                looking_for = expected_iter.next();
            }
        }
    }
    assert!(
        looking_for.is_none(),
        "missing {looking_for:?} from stream: {labels:?}"
    );
}

/// Assert seqs are strictly increasing and gap-free (synthetic `hello`
/// with seq 0 and `gap` sentinels excluded).
pub fn assert_gap_free(events: &[Arc<Event>]) {
    let mut previous: Option<u64> = None;
    for event in events {
        if event.kind == EventKind::Hello || event.kind == EventKind::Gap {
            continue;
        }
        if let Some(previous) = previous {
            assert_eq!(
                event.seq,
                previous + 1,
                "gap between {previous} and {} in stream",
                event.seq
            );
        }
        previous = Some(event.seq);
    }
}

/// Assert exactly one terminal status event, and that nothing follows it.
pub fn assert_single_terminal(events: &[Arc<Event>], expected: RunStatus) {
    let terminal_positions: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| {
            e.kind == EventKind::Status && e.run_status().is_some_and(|s| s.is_terminal())
        })
        .map(|(i, _)| i)
        .collect();
    assert_eq!(
        terminal_positions.len(),
        1,
        "expected exactly one terminal status event: {:?}",
        events.iter().map(|e| label(e)).collect::<Vec<_>>()
    );
    let position = terminal_positions[0];
    assert_eq!(events[position].run_status(), Some(expected));
    assert_eq!(
        position,
        events.len() - 1,
        "events found after the terminal status"
    );
}

/// Seq of the first event matching the label, panicking when absent.
pub fn seq_of(events: &[Arc<Event>], wanted: &str) -> u64 {
    events
        .iter()
        .find(|e| label(e) == wanted)
        .unwrap_or_else(|| panic!("no event labeled {wanted}"))
        .seq
}

pub fn has_label(events: &[Arc<Event>], wanted: &str) -> bool {
    events.iter().any(|e| label(e) == wanted)
}

/// Fold `status`/`node_status` events into the final (run, node) states —
/// the replay-reconstruction contract.
pub fn replay_states(
    events: &[Arc<Event>],
) -> (Option<RunStatus>, std::collections::BTreeMap<String, NodeStatus>) {
    let mut run_status = None;
    let mut nodes = std::collections::BTreeMap::new();
    for event in events {
        match event.kind {
            EventKind::Status => run_status = event.run_status(),
            EventKind::NodeStatus => {
                if let (Some(node), Some(status)) = (event.node_id(), event.node_status()) {
                    nodes.insert(node.to_string(), status);
                }
            }
            _ => {}
        }
    }
    (run_status, nodes)
}
