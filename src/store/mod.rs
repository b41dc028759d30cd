//! Persistent run and node state behind a backend-agnostic interface.
//!
//! A [`RunStore`] holds the authoritative [`Run`] and [`NodeState`]
//! records. Status transitions go through compare-and-set
//! ([`RunStore::update_status`]) so concurrent writers (a canceling client
//! racing a succeeding scheduler) resolve deterministically: the first
//! writer wins, the second observes a conflict and re-reads.
//!
//! Three backends share the interface:
//!
//! - [`MemoryRunStore`] — process-local, lost on restart; dev and tests.
//! - [`RedisRunStore`] — hash-per-run layout, survives restarts.
//! - [`KubeRunStore`] — run records in memory, node state reflected from
//!   labeled Job objects (writes to the cluster go through the K8s driver).
//!
//! Consistency rule shared by all of them: the scheduler appends the event
//! first and updates the store second, so observable state never runs
//! ahead of the stream and recovery can re-derive state from events.

pub mod memory;
pub mod redis;

#[cfg(feature = "kubernetes")]
pub mod k8s;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::plan::Plan;
use crate::types::{NodeStatus, RunMode, RunStatus};

pub use self::memory::MemoryRunStore;
pub use self::redis::RedisRunStore;

#[cfg(feature = "kubernetes")]
pub use self::k8s::KubeRunStore;

/// One execution of a plan.
///
/// The plan is immutable after creation and shared by reference; all
/// mutable state lives in `status`, the timestamps, and the terminal
/// `error` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub plan: Arc<Plan>,
    pub mode: RunMode,
    pub status: RunStatus,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Run {
    #[must_use]
    pub fn new(id: String, plan: Arc<Plan>, mode: RunMode, metadata: Value) -> Self {
        Self {
            id,
            plan,
            mode,
            status: RunStatus::Queued,
            metadata,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// Execution state of a single node within a run. One record per
/// `(run, node)`; `attempt` only ever increases.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeState {
    pub run_id: String,
    pub node_id: String,
    pub status: NodeStatus,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl NodeState {
    #[must_use]
    pub fn pending(run_id: &str, node_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            status: NodeStatus::Pending,
            attempt: 1,
            started_at: None,
            finished_at: None,
            error: None,
            output: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run not found: {id}")]
    NotFound { id: String },

    #[error("run already exists: {id}")]
    AlreadyExists { id: String },

    #[error("status transition rejected for run {id}: expected {expected}, found {found}")]
    StatusConflict {
        id: String,
        expected: RunStatus,
        found: RunStatus,
    },

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("operation not implemented by this backend")]
    NotImplemented,

    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }

    /// Conflicts are expected under races and usually handled by
    /// re-reading; everything else propagates.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyExists { .. } | Self::StatusConflict { .. } | Self::InvalidTransition { .. }
        )
    }
}

/// Backend-agnostic persistence for runs and their node states.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a new run. Fails with [`StoreError::AlreadyExists`] when the
    /// id is taken.
    async fn create(&self, run: Run) -> Result<Run, StoreError>;

    async fn get(&self, id: &str) -> Result<Run, StoreError>;

    /// All known runs. Backends may answer [`StoreError::NotImplemented`];
    /// the control plane maps that to 501.
    async fn list(&self) -> Result<Vec<Run>, StoreError>;

    /// Compare-and-set status transition. Only transitions permitted by
    /// [`RunStatus::can_transition_to`] are accepted; a mismatch between
    /// `expected` and the stored status yields
    /// [`StoreError::StatusConflict`] with the value actually found.
    /// `error` is recorded on the run for terminal failures.
    async fn update_status(
        &self,
        id: &str,
        expected: RunStatus,
        next: RunStatus,
        error: Option<String>,
    ) -> Result<Run, StoreError>;

    /// Last-write-wins upsert; the owning scheduler serializes writes per
    /// run so this needs no CAS.
    async fn put_node_state(&self, state: NodeState) -> Result<(), StoreError>;

    /// Node states of a run, sorted by node id.
    async fn node_states(&self, run_id: &str) -> Result<Vec<NodeState>, StoreError>;

    /// Soft delete; backends may retain the record for a TTL.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// Shared transition bookkeeping used by every backend: validate the
/// transition and stamp the lifecycle timestamps.
pub(crate) fn apply_transition(
    run: &mut Run,
    expected: RunStatus,
    next: RunStatus,
    error: Option<String>,
) -> Result<(), StoreError> {
    if run.status != expected {
        return Err(StoreError::StatusConflict {
            id: run.id.clone(),
            expected,
            found: run.status,
        });
    }
    if !expected.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            from: expected,
            to: next,
        });
    }
    run.status = next;
    let now = Utc::now();
    if next == RunStatus::Running && run.started_at.is_none() {
        run.started_at = Some(now);
    }
    if next.is_terminal() {
        run.finished_at = Some(now);
    }
    if let Some(error) = error {
        run.error = Some(error);
    }
    Ok(())
}
