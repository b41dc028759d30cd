//! Node execution drivers.
//!
//! A [`Driver`] runs a single node attempt and reports a classified
//! [`ExecOutcome`]. Drivers are deliberately decoupled from the run: they
//! receive a [`DriverContext`] carrying ids, a cancellation token, and the
//! event log handle, never the `Run` itself, so they can be unit tested in
//! isolation and cannot keep a run alive.
//!
//! Variants:
//!
//! - [`SimulatedDriver`] — deterministic in-process execution for tests
//!   and demos.
//! - [`SubprocessDriver`] — spawns a local command, forwarding stdout
//!   lines as `log` events.
//! - [`RedisTaskDriver`] — enqueues work for external workers over Redis
//!   lists and awaits the result key.
//! - [`KubeJobDriver`] — runs the node as a Kubernetes Job (optionally a
//!   CronJob for scheduled nodes).

pub mod redis;
pub mod simulated;
pub mod subprocess;

#[cfg(feature = "kubernetes")]
pub mod k8s;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::event_log::{EventLog, payload};
use crate::plan::NodeSpec;
use crate::types::{EventKind, RunMode};

pub use self::redis::RedisTaskDriver;
pub use self::simulated::SimulatedDriver;
pub use self::subprocess::SubprocessDriver;

#[cfg(feature = "kubernetes")]
pub use self::k8s::KubeJobDriver;

/// How long a driver may take to acknowledge cancellation before the
/// scheduler stops waiting for it.
pub const CANCEL_ACK_TIMEOUT_SECS: u64 = 5;

/// Whether a failure is worth retrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// Result of one node attempt.
#[derive(Clone, Debug)]
pub enum ExecOutcome {
    /// Node finished; `outputs` maps pin names to values.
    Ok {
        outputs: serde_json::Map<String, Value>,
    },
    Fail {
        kind: FailureKind,
        message: String,
        retriable: bool,
    },
    /// The attempt observed cancellation and stopped.
    Canceled,
}

impl ExecOutcome {
    #[must_use]
    pub fn success(outputs: serde_json::Map<String, Value>) -> Self {
        Self::Ok { outputs }
    }

    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Fail {
            kind: FailureKind::Transient,
            message: message.into(),
            retriable: true,
        }
    }

    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Fail {
            kind: FailureKind::Permanent,
            message: message.into(),
            retriable: false,
        }
    }
}

/// Per-attempt execution context.
///
/// Holds weak coupling only: ids plus the shared event log. Cancelling
/// `cancel` is the cooperative stop signal; drivers must honor it within
/// [`CANCEL_ACK_TIMEOUT_SECS`].
#[derive(Clone)]
pub struct DriverContext {
    pub run_id: String,
    pub node_id: String,
    pub attempt: u32,
    pub cancel: CancellationToken,
    pub events: Arc<EventLog>,
}

impl DriverContext {
    /// Forward one line of driver output as a `log` event. Best-effort: a
    /// closed log (run already terminal) drops the line.
    pub fn emit_log(&self, line: &str) {
        if let Err(err) = self.events.append(
            &self.run_id,
            EventKind::Log,
            payload::log_line(&self.node_id, line),
        ) {
            tracing::debug!(
                run_id = %self.run_id,
                node_id = %self.node_id,
                error = %err,
                "dropping log line for closed event log"
            );
        }
    }
}

/// Executes a single node attempt.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Run one attempt to completion (or cancellation). Infallible at the
    /// signature level: every failure mode folds into
    /// [`ExecOutcome::Fail`].
    async fn execute(
        &self,
        ctx: DriverContext,
        node: &NodeSpec,
        inputs: serde_json::Map<String, Value>,
    ) -> ExecOutcome;

    /// Best-effort, idempotent termination of a running attempt.
    async fn abort(&self, run_id: &str, node_id: &str);

    /// Recent output lines of a node, newest last. Empty when the variant
    /// does not capture logs.
    async fn logs(&self, run_id: &str, node_id: &str, tail: Option<usize>) -> Vec<String> {
        let _ = (run_id, node_id, tail);
        Vec::new()
    }
}

/// Runtime dispatch over the driver variants.
///
/// The scheduler picks a driver per node from the run's mode plus the
/// node's shape: an explicit `cmd` param routes to the subprocess driver,
/// an `agent_ref` routes to the mode's remote backend, anything else runs
/// simulated.
pub struct DriverSet {
    simulated: Arc<SimulatedDriver>,
    subprocess: Arc<SubprocessDriver>,
    redis: Option<Arc<RedisTaskDriver>>,
    #[cfg(feature = "kubernetes")]
    k8s: Option<Arc<KubeJobDriver>>,
}

impl DriverSet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            simulated: Arc::new(SimulatedDriver::new()),
            subprocess: Arc::new(SubprocessDriver::new()),
            redis: None,
            #[cfg(feature = "kubernetes")]
            k8s: None,
        }
    }

    #[must_use]
    pub fn with_redis(mut self, driver: Arc<RedisTaskDriver>) -> Self {
        self.redis = Some(driver);
        self
    }

    #[cfg(feature = "kubernetes")]
    #[must_use]
    pub fn with_k8s(mut self, driver: Arc<KubeJobDriver>) -> Self {
        self.k8s = Some(driver);
        self
    }

    /// Pick the driver for one node. Falls back to the simulated driver
    /// when the mode's backend is not configured.
    #[must_use]
    pub fn select(&self, mode: RunMode, node: &NodeSpec) -> Arc<dyn Driver> {
        if node.params.contains_key("cmd") {
            return Arc::clone(&self.subprocess) as Arc<dyn Driver>;
        }
        if node.agent_ref.is_some() {
            match mode {
                RunMode::Redis => {
                    if let Some(redis) = &self.redis {
                        return Arc::clone(redis) as Arc<dyn Driver>;
                    }
                }
                #[cfg(feature = "kubernetes")]
                RunMode::K8s => {
                    if let Some(k8s) = &self.k8s {
                        return Arc::clone(k8s) as Arc<dyn Driver>;
                    }
                }
                _ => {}
            }
        }
        Arc::clone(&self.simulated) as Arc<dyn Driver>
    }
}

impl Default for DriverSet {
    fn default() -> Self {
        Self::new()
    }
}
