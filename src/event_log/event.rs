use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{EventKind, NodeStatus, RunStatus};

/// Checkpoint labels the engine recognizes for UI grouping. Labels are
/// otherwise free-form strings.
pub const CHECKPOINT_NODE_EXEC: &str = "node:exec";
pub const CHECKPOINT_EDGE_TRANSMIT: &str = "edge:transmit";
pub const CHECKPOINT_TOOL_CALL: &str = "tool:call";

/// One entry on a run's event stream.
///
/// `seq` is assigned at append time, starts at 1, and is never rewritten.
/// Synthetic events produced outside the log (the `hello` greeting and the
/// `gap` sentinel) use `seq = 0` and the seq of the last missed event
/// respectively.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub run_id: String,
    pub kind: EventKind,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

impl Event {
    /// Node id referenced by this event's payload, when present.
    #[must_use]
    pub fn node_id(&self) -> Option<&str> {
        self.payload.get("node_id").and_then(Value::as_str)
    }

    /// Run status carried by a `status` event payload.
    #[must_use]
    pub fn run_status(&self) -> Option<RunStatus> {
        self.payload
            .get("status")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    /// Node status carried by a `node_status` event payload.
    #[must_use]
    pub fn node_status(&self) -> Option<NodeStatus> {
        self.payload
            .get("status")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }
}

/// Payload constructors for the engine-emitted event kinds.
///
/// Keeping these in one place pins the payload shapes the frontend and the
/// replay-reconciliation logic depend on.
pub mod payload {
    use super::*;

    pub fn hello(run_id: &str, current_status: RunStatus, resumed: bool) -> Value {
        serde_json::json!({
            "run_id": run_id,
            "current_status": current_status,
            "resumed": resumed,
        })
    }

    pub fn status(status: RunStatus, error: Option<&crate::types::RunError>) -> Value {
        match error {
            Some(error) => serde_json::json!({ "status": status, "error": error }),
            None => serde_json::json!({ "status": status }),
        }
    }

    pub fn node_status(
        node_id: &str,
        status: NodeStatus,
        attempt: u32,
        error: Option<&str>,
    ) -> Value {
        let mut payload = serde_json::json!({
            "node_id": node_id,
            "status": status,
            "attempt": attempt,
        });
        if let Some(error) = error {
            payload["error"] = Value::String(error.to_string());
        }
        payload
    }

    pub fn log_line(node_id: &str, line: &str) -> Value {
        serde_json::json!({ "node_id": node_id, "line": line })
    }

    pub fn checkpoint(label: &str, data: Value) -> Value {
        serde_json::json!({ "label": label, "data": data })
    }

    pub fn artifact(node_id: &str, outputs: &Value) -> Value {
        serde_json::json!({ "node_id": node_id, "outputs": outputs })
    }

    pub fn heartbeat(now: DateTime<Utc>) -> Value {
        serde_json::json!({ "ts": now.to_rfc3339() })
    }

    pub fn gap(from: u64, to: u64) -> Value {
        serde_json::json!({ "from": from, "to": to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_accessors() {
        let event = Event {
            seq: 3,
            run_id: "r1".into(),
            kind: EventKind::NodeStatus,
            payload: payload::node_status("alpha", NodeStatus::Running, 1, None),
            ts: Utc::now(),
        };
        assert_eq!(event.node_id(), Some("alpha"));
        assert_eq!(event.node_status(), Some(NodeStatus::Running));
        assert_eq!(event.run_status(), None);

        let failure = crate::types::RunError::new(crate::types::ErrorKind::Internal, "boom");
        let event = Event {
            seq: 9,
            run_id: "r1".into(),
            kind: EventKind::Status,
            payload: payload::status(RunStatus::Failed, Some(&failure)),
            ts: Utc::now(),
        };
        assert_eq!(event.run_status(), Some(RunStatus::Failed));
        assert_eq!(event.payload["error"]["kind"], "internal");
        assert_eq!(event.payload["error"]["message"], "boom");
    }
}
