//! Delivery of run events to external subscribers.
//!
//! Two transports share the per-run [`EventLog`](crate::event_log::EventLog)
//! cursors:
//!
//! - [`sse`] — one stream task per HTTP connection, with `Last-Event-ID`
//!   resume, bounded replay, gap sentinels, and heartbeat frames.
//! - [`ws`] — a single process-wide hub task owning the connection set;
//!   connections subscribe to run topics and receive `{run_id, event}`
//!   frames filtered per subscription.
//!
//! Both preserve strictly increasing `seq` per run within one
//! subscription; there is no ordering across runs.

pub mod sse;
pub mod ws;

use serde::Deserialize;

use crate::event_log::Event;
use crate::types::EventKind;

pub use ws::WsHub;

/// Per-subscription event filter.
///
/// An empty filter accepts everything. Events that carry no node id (run
/// `status`, `checkpoint`, …) always pass a `node_ids` filter — dropping
/// them would hide stream-terminating events from the subscriber.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub kinds: Option<Vec<EventKind>>,
    #[serde(default)]
    pub node_ids: Option<Vec<String>>,
}

impl SubscriptionFilter {
    #[must_use]
    pub fn accepts(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(node_ids) = &self.node_ids {
            if let Some(node_id) = event.node_id() {
                if !node_ids.iter().any(|id| id == node_id) {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::payload;
    use crate::types::NodeStatus;

    fn event(kind: EventKind, payload: serde_json::Value) -> Event {
        Event {
            seq: 1,
            run_id: "r".into(),
            kind,
            payload,
            ts: chrono::Utc::now(),
        }
    }

    #[test]
    fn empty_filter_accepts_everything() {
        let filter = SubscriptionFilter::default();
        assert!(filter.accepts(&event(EventKind::Log, payload::log_line("n", "x"))));
    }

    #[test]
    fn kind_and_node_filters_compose() {
        let filter = SubscriptionFilter {
            kinds: Some(vec![EventKind::NodeStatus]),
            node_ids: Some(vec!["a".into()]),
        };
        assert!(filter.accepts(&event(
            EventKind::NodeStatus,
            payload::node_status("a", NodeStatus::Running, 1, None),
        )));
        assert!(!filter.accepts(&event(
            EventKind::NodeStatus,
            payload::node_status("b", NodeStatus::Running, 1, None),
        )));
        assert!(!filter.accepts(&event(EventKind::Log, payload::log_line("a", "x"))));
    }

    #[test]
    fn node_filter_passes_run_level_events() {
        let filter = SubscriptionFilter {
            kinds: None,
            node_ids: Some(vec!["a".into()]),
        };
        let status = event(
            EventKind::Status,
            payload::status(crate::types::RunStatus::Succeeded, None),
        );
        assert!(filter.accepts(&status));
    }
}
