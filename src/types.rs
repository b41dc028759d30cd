//! Core status and mode enums shared across the run engine.
//!
//! These are the domain vocabulary of the orchestrator: what a run *is*
//! ([`RunStatus`]), what a node within a run is ([`NodeStatus`]), which
//! backend family a run executes on ([`RunMode`]), and what kinds of events
//! a run's stream can carry ([`EventKind`]).
//!
//! All of them serialize to the lowercase snake_case strings used on the
//! wire, so the same derives cover persistence (Redis hashes), the HTTP
//! control plane, and SSE/WebSocket payloads.
//!
//! # Examples
//!
//! ```
//! use mentat_orchestrator::types::{RunStatus, NodeStatus, RunMode};
//!
//! assert!(RunStatus::Queued.can_transition_to(RunStatus::Running));
//! assert!(!RunStatus::Succeeded.can_transition_to(RunStatus::Canceled));
//! assert!(NodeStatus::Failed.is_terminal());
//! assert_eq!("redis".parse::<RunMode>().unwrap(), RunMode::Redis);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a whole run.
///
/// The transition graph is strict and monotonic: `queued → running →
/// {succeeded, failed, canceled}`, plus the short-circuit `queued →
/// canceled` for runs canceled before they start. Terminal states are
/// absorbing; [`can_transition_to`](Self::can_transition_to) is the single
/// source of truth consulted by every store's compare-and-set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    /// Returns `true` for the absorbing states.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Queued, Running) | (Queued, Canceled) | (Running, Succeeded | Failed | Canceled)
        )
    }

    /// Stable wire form, identical to the serde representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(ParseEnumError::new("run status", other)),
        }
    }
}

/// Per-node execution state within a run.
///
/// `Pending` and `Ready` are internal scheduling states; they are persisted
/// but never published as `node_status` events. `Skipped` is reserved for
/// conditional-edge routing and is currently never produced by the
/// scheduler (failure cascades mark nodes `Canceled`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Canceled,
}

impl NodeStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Canceled
        )
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "canceled" => Ok(Self::Canceled),
            other => Err(ParseEnumError::new("node status", other)),
        }
    }
}

/// Which backend family a run executes on.
///
/// The mode selects both the [`RunStore`](crate::store::RunStore) backend
/// and the default [`Driver`](crate::driver::Driver) used for nodes without
/// a more specific `agent_ref` routing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Memory,
    Redis,
    K8s,
}

impl RunMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis => "redis",
            Self::K8s => "k8s",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            "k8s" => Ok(Self::K8s),
            other => Err(ParseEnumError::new("run mode", other)),
        }
    }
}

/// Kind discriminator of an event on a run's stream.
///
/// `Gap` is a synthetic sentinel: it is never appended to a log, only
/// materialized during replay when a cursor predates the retention floor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Hello,
    Status,
    NodeStatus,
    Log,
    Checkpoint,
    Artifact,
    Heartbeat,
    Gap,
}

impl EventKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Status => "status",
            Self::NodeStatus => "node_status",
            Self::Log => "log",
            Self::Checkpoint => "checkpoint",
            Self::Artifact => "artifact",
            Self::Heartbeat => "heartbeat",
            Self::Gap => "gap",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hello" => Ok(Self::Hello),
            "status" => Ok(Self::Status),
            "node_status" => Ok(Self::NodeStatus),
            "log" => Ok(Self::Log),
            "checkpoint" => Ok(Self::Checkpoint),
            "artifact" => Ok(Self::Artifact),
            "heartbeat" => Ok(Self::Heartbeat),
            "gap" => Ok(Self::Gap),
            other => Err(ParseEnumError::new("event kind", other)),
        }
    }
}

/// Error taxonomy used on run streams and control-plane responses.
///
/// Only `TransientDriver`/`PermanentDriver`/`Backend`/`Internal` appear on
/// event payloads; the first three surface synchronously from the control
/// plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    TransientDriver,
    PermanentDriver,
    Backend,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not-found",
            Self::Conflict => "conflict",
            Self::TransientDriver => "transient-driver",
            Self::PermanentDriver => "permanent-driver",
            Self::Backend => "backend",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified terminal failure of a run, carried on the final `status`
/// event as `{"error": {"kind": ..., "message": ...}}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RunError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Error produced when parsing any of the enums in this module.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("unknown {what}: {value}")]
pub struct ParseEnumError {
    what: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_transitions() {
        assert!(RunStatus::Queued.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Queued.can_transition_to(RunStatus::Canceled));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Succeeded));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Canceled));

        for terminal in [
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Canceled,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                RunStatus::Queued,
                RunStatus::Running,
                RunStatus::Succeeded,
                RunStatus::Failed,
                RunStatus::Canceled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn wire_round_trips() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_string(&EventKind::NodeStatus).unwrap(),
            "\"node_status\""
        );
        assert_eq!("k8s".parse::<RunMode>().unwrap(), RunMode::K8s);
        assert!("podman".parse::<RunMode>().is_err());
    }
}
