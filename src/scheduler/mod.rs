//! Per-run scheduling: the DAG state machine from `queued` to a terminal
//! status.
//!
//! One [`Scheduler`] task owns each running run. It computes the ready
//! set, dispatches node attempts to drivers through a bounded
//! [`JoinSet`], records every transition as an event *before* the store
//! write, and owns the terminal transition — including the bounded-grace
//! cancellation drain.
//!
//! Ordering discipline: events first, store second. The store's CAS
//! resolves the cancel-vs-success race; the event log's per-run lock
//! makes the stream totally ordered.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::driver::{Driver, DriverContext, DriverSet, ExecOutcome, FailureKind};
use crate::event_log::{CHECKPOINT_NODE_EXEC, EventLog, payload};
use crate::plan::CompiledPlan;
use crate::store::{NodeState, RunStore, StoreError};
use crate::types::{ErrorKind, EventKind, NodeStatus, RunError, RunMode, RunStatus};

/// Tunables for one run's scheduling loop.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub max_concurrent_nodes: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub node_timeout: Duration,
    pub cancel_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: 4,
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            node_timeout: Duration::from_secs(600),
            cancel_grace: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff with jitter: `base * 2^failures`, capped, plus up
/// to 25% random spread so retry storms decorrelate.
fn backoff_delay(config: &SchedulerConfig, failures: u32) -> Duration {
    let exp = config
        .backoff_base
        .saturating_mul(2u32.saturating_pow(failures.saturating_sub(1)));
    let capped = exp.min(config.backoff_cap);
    let jitter = rand::thread_rng().gen_range(0.0..=0.25);
    capped.mul_f64(1.0 + jitter).min(config.backoff_cap)
}

/// How many times a store write is retried before the run is declared
/// failed with a backend error.
const BACKEND_ATTEMPTS: u32 = 3;

struct NodeRuntime {
    state: NodeState,
    /// Earliest instant a retry may be dispatched.
    eligible_at: Option<Instant>,
}

/// Drives one run to a terminal status.
pub struct Scheduler {
    run_id: String,
    plan: CompiledPlan,
    mode: RunMode,
    store: Arc<dyn RunStore>,
    events: Arc<EventLog>,
    drivers: Arc<DriverSet>,
    config: SchedulerConfig,
    cancel: CancellationToken,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        run_id: String,
        plan: CompiledPlan,
        mode: RunMode,
        store: Arc<dyn RunStore>,
        events: Arc<EventLog>,
        drivers: Arc<DriverSet>,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            plan,
            mode,
            store,
            events,
            drivers,
            config,
            cancel,
        }
    }

    /// Run the full lifecycle and return the terminal status. The caller
    /// (RunManager) has already CAS-ed the run to `running` and appended
    /// the `status(running)` event; this task owns everything from node
    /// dispatch to the terminal event and the log close.
    #[instrument(skip(self), fields(run_id = %self.run_id))]
    pub async fn run(self) -> RunStatus {
        let mut nodes: FxHashMap<String, NodeRuntime> = FxHashMap::default();
        for spec in self.plan.nodes() {
            let state = NodeState::pending(&self.run_id, &spec.id);
            if let Err(err) = self.put_node_state_retrying(&state).await {
                return self
                    .finish_failed(RunError::new(ErrorKind::Backend, err.to_string()))
                    .await;
            }
            nodes.insert(
                spec.id.clone(),
                NodeRuntime {
                    state,
                    eligible_at: None,
                },
            );
        }

        let mut inflight: JoinSet<(String, ExecOutcome)> = JoinSet::new();
        let mut running_drivers: FxHashMap<String, Arc<dyn Driver>> = FxHashMap::default();
        let mut failure: Option<RunError> = None;

        let terminal = loop {
            if self.cancel.is_cancelled() {
                break self
                    .drain_canceled(&mut nodes, &mut inflight, &mut running_drivers)
                    .await;
            }

            // Nodes whose dependencies can no longer be satisfied will
            // never become ready; cancel them so the run can converge.
            if let Err(err) = self.sweep_unsatisfiable(&mut nodes).await {
                failure = Some(RunError::new(ErrorKind::Backend, err.to_string()));
            }

            if failure.is_none() {
                if let Err(err) = self
                    .dispatch_ready(&mut nodes, &mut inflight, &mut running_drivers)
                    .await
                {
                    failure = Some(RunError::new(ErrorKind::Backend, err.to_string()));
                }
            }

            if let Some(error) = failure.take() {
                self.cancel.cancel();
                self.drain_inflight(&mut nodes, &mut inflight, &mut running_drivers)
                    .await;
                break self.finish_failed(error).await;
            }

            if inflight.is_empty() {
                if nodes.values().all(|rt| rt.state.status.is_terminal()) {
                    break self.conclude(&nodes).await;
                }
                // Nothing running: either a retry is parked on backoff or
                // the loop has genuinely stalled.
                let Some(wake_at) = nodes.values().filter_map(|rt| rt.eligible_at).min() else {
                    break self
                        .finish_failed(RunError::new(
                            ErrorKind::Internal,
                            "scheduler stalled with no runnable nodes",
                        ))
                        .await;
                };
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(wake_at) => {}
                }
                continue;
            }

            let next_wake = nodes.values().filter_map(|rt| rt.eligible_at).min();
            let joined = tokio::select! {
                _ = self.cancel.cancelled() => None,
                joined = inflight.join_next() => joined,
                _ = Self::sleep_until_opt(next_wake) => continue,
            };

            let Some(joined) = joined else {
                continue;
            };

            match joined {
                Ok((node_id, outcome)) => {
                    running_drivers.remove(&node_id);
                    if let Err(err) = self.settle(&mut nodes, &node_id, outcome, &mut failure).await
                    {
                        failure = Some(RunError::new(ErrorKind::Backend, err.to_string()));
                    }
                }
                Err(join_err) => {
                    // A panicking node task is an engine invariant
                    // violation, not a node failure classification.
                    failure = Some(RunError::new(
                        ErrorKind::Internal,
                        format!("node task failed: {join_err}"),
                    ));
                }
            }
        };

        terminal
    }

    async fn sleep_until_opt(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Dispatch every ready node up to the concurrency bound, in plan
    /// declaration order.
    async fn dispatch_ready(
        &self,
        nodes: &mut FxHashMap<String, NodeRuntime>,
        inflight: &mut JoinSet<(String, ExecOutcome)>,
        running_drivers: &mut FxHashMap<String, Arc<dyn Driver>>,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        loop {
            if inflight.len() >= self.config.max_concurrent_nodes {
                return Ok(());
            }
            let Some(node_id) = self.next_ready(nodes, now) else {
                return Ok(());
            };

            let spec = self
                .plan
                .node(&node_id)
                .expect("ready node exists in plan")
                .clone();
            let inputs = self.build_inputs(nodes, &node_id);

            {
                let rt = nodes.get_mut(&node_id).expect("ready node tracked");
                rt.state.status = NodeStatus::Running;
                rt.state.started_at = Some(chrono::Utc::now());
                rt.eligible_at = None;
                self.emit(
                    EventKind::NodeStatus,
                    payload::node_status(&node_id, NodeStatus::Running, rt.state.attempt, None),
                );
                self.emit(
                    EventKind::Checkpoint,
                    payload::checkpoint(
                        CHECKPOINT_NODE_EXEC,
                        serde_json::json!({ "node_id": node_id, "attempt": rt.state.attempt }),
                    ),
                );
                let state = rt.state.clone();
                self.put_node_state_retrying(&state).await?;
            }

            let driver = self.drivers.select(self.mode, &spec);
            running_drivers.insert(node_id.clone(), Arc::clone(&driver));

            let ctx = DriverContext {
                run_id: self.run_id.clone(),
                node_id: node_id.clone(),
                attempt: nodes[&node_id].state.attempt,
                cancel: self.cancel.child_token(),
                events: Arc::clone(&self.events),
            };
            let timeout = self.config.node_timeout;
            inflight.spawn(async move {
                let run_id = ctx.run_id.clone();
                let outcome =
                    match tokio::time::timeout(timeout, driver.execute(ctx, &spec, inputs)).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            driver.abort(&run_id, &spec.id).await;
                            ExecOutcome::transient(format!(
                                "attempt exceeded node timeout of {timeout:?}"
                            ))
                        }
                    };
                (node_id, outcome)
            });
        }
    }

    /// First pending node (declaration order) whose dependencies are
    /// satisfied and whose backoff window has elapsed.
    fn next_ready(&self, nodes: &FxHashMap<String, NodeRuntime>, now: Instant) -> Option<String> {
        for spec in self.plan.nodes() {
            let rt = &nodes[&spec.id];
            if rt.state.status != NodeStatus::Pending {
                continue;
            }
            if rt.eligible_at.is_some_and(|at| at > now) {
                continue;
            }
            if self.deps_satisfied(nodes, &spec.id) {
                return Some(spec.id.clone());
            }
        }
        None
    }

    /// Every incoming edge's source succeeded and, where the edge names a
    /// source pin, that pin exists in the source's output.
    fn deps_satisfied(&self, nodes: &FxHashMap<String, NodeRuntime>, node_id: &str) -> bool {
        self.plan.incoming(node_id).iter().all(|edge| {
            let Some(src) = nodes.get(&edge.src.node) else {
                return false;
            };
            if src.state.status != NodeStatus::Succeeded {
                return false;
            }
            match &edge.src.pin {
                Some(pin) => src
                    .state
                    .output
                    .as_ref()
                    .and_then(|output| output.get(pin))
                    .is_some(),
                None => true,
            }
        })
    }

    /// A pending node is unsatisfiable once any upstream edge can never
    /// deliver: the source reached a terminal state other than success,
    /// or succeeded without producing the named pin.
    fn deps_unsatisfiable(&self, nodes: &FxHashMap<String, NodeRuntime>, node_id: &str) -> bool {
        self.plan.incoming(node_id).iter().any(|edge| {
            let Some(src) = nodes.get(&edge.src.node) else {
                return true;
            };
            match src.state.status {
                NodeStatus::Succeeded => match &edge.src.pin {
                    Some(pin) => src
                        .state
                        .output
                        .as_ref()
                        .and_then(|output| output.get(pin))
                        .is_none(),
                    None => false,
                },
                status => status.is_terminal(),
            }
        })
    }

    async fn sweep_unsatisfiable(
        &self,
        nodes: &mut FxHashMap<String, NodeRuntime>,
    ) -> Result<(), StoreError> {
        // Repeat until fixpoint so cancellation cascades down chains.
        loop {
            let doomed: Vec<String> = self
                .plan
                .nodes()
                .filter(|spec| {
                    nodes[&spec.id].state.status == NodeStatus::Pending
                        && self.deps_unsatisfiable(nodes, &spec.id)
                })
                .map(|spec| spec.id.clone())
                .collect();
            if doomed.is_empty() {
                return Ok(());
            }
            for node_id in doomed {
                self.mark_node(
                    nodes,
                    &node_id,
                    NodeStatus::Canceled,
                    Some("upstream dependency will never be satisfied"),
                )
                .await?;
            }
        }
    }

    /// Inputs for a node: one entry per incoming edge, keyed by the
    /// destination pin (or the source node id when the edge has none).
    fn build_inputs(
        &self,
        nodes: &FxHashMap<String, NodeRuntime>,
        node_id: &str,
    ) -> serde_json::Map<String, Value> {
        let mut inputs = serde_json::Map::new();
        for edge in self.plan.incoming(node_id) {
            let Some(output) = nodes
                .get(&edge.src.node)
                .and_then(|src| src.state.output.clone())
            else {
                continue;
            };
            let value = match &edge.src.pin {
                Some(pin) => output.get(pin).cloned().unwrap_or(Value::Null),
                None => output,
            };
            let key = edge
                .dst
                .pin
                .clone()
                .unwrap_or_else(|| edge.src.node.clone());
            inputs.insert(key, value);
        }
        inputs
    }

    /// Apply one attempt's outcome: success, retry, node failure (which
    /// fails the run), or cancellation.
    async fn settle(
        &self,
        nodes: &mut FxHashMap<String, NodeRuntime>,
        node_id: &str,
        outcome: ExecOutcome,
        failure: &mut Option<RunError>,
    ) -> Result<(), StoreError> {
        match outcome {
            ExecOutcome::Ok { outputs } => {
                let output = Value::Object(outputs);
                if output.as_object().is_some_and(|o| !o.is_empty()) {
                    self.emit(EventKind::Artifact, payload::artifact(node_id, &output));
                }
                nodes
                    .get_mut(node_id)
                    .expect("settled node tracked")
                    .state
                    .output = Some(output);
                self.mark_node(nodes, node_id, NodeStatus::Succeeded, None)
                    .await
            }
            ExecOutcome::Fail {
                kind,
                message,
                retriable,
            } => {
                let attempt = nodes[node_id].state.attempt;
                let may_retry =
                    kind == FailureKind::Transient && retriable && attempt <= self.config.max_retries;
                if may_retry {
                    let delay = backoff_delay(&self.config, attempt);
                    self.emit(
                        EventKind::Log,
                        payload::log_line(
                            node_id,
                            &format!(
                                "attempt {attempt} failed ({message}); retrying in {delay:?}"
                            ),
                        ),
                    );
                    let rt = nodes.get_mut(node_id).expect("settled node tracked");
                    rt.state.status = NodeStatus::Pending;
                    rt.state.attempt += 1;
                    rt.state.error = Some(message);
                    rt.eligible_at = Some(Instant::now() + delay);
                    let state = rt.state.clone();
                    self.put_node_state_retrying(&state).await
                } else {
                    self.mark_node(nodes, node_id, NodeStatus::Failed, Some(&message))
                        .await?;
                    let error_kind = match kind {
                        FailureKind::Transient => ErrorKind::TransientDriver,
                        FailureKind::Permanent => ErrorKind::PermanentDriver,
                    };
                    *failure = Some(RunError::new(
                        error_kind,
                        format!("node {node_id} failed: {message}"),
                    ));
                    Ok(())
                }
            }
            ExecOutcome::Canceled => {
                self.mark_node(nodes, node_id, NodeStatus::Canceled, None)
                    .await
            }
        }
    }

    /// Publish and persist a terminal node transition.
    async fn mark_node(
        &self,
        nodes: &mut FxHashMap<String, NodeRuntime>,
        node_id: &str,
        status: NodeStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let rt = nodes.get_mut(node_id).expect("marked node tracked");
        rt.state.status = status;
        rt.state.finished_at = Some(chrono::Utc::now());
        if let Some(error) = error {
            rt.state.error = Some(error.to_string());
        }
        rt.eligible_at = None;
        self.emit(
            EventKind::NodeStatus,
            payload::node_status(node_id, status, rt.state.attempt, error),
        );
        let state = rt.state.clone();
        self.put_node_state_retrying(&state).await
    }

    async fn abort_running(&self, running_drivers: &FxHashMap<String, Arc<dyn Driver>>) {
        for (node_id, driver) in running_drivers {
            driver.abort(&self.run_id, node_id).await;
        }
    }

    /// Cancellation drain plus the terminal `canceled` sequence.
    async fn drain_canceled(
        &self,
        nodes: &mut FxHashMap<String, NodeRuntime>,
        inflight: &mut JoinSet<(String, ExecOutcome)>,
        running_drivers: &mut FxHashMap<String, Arc<dyn Driver>>,
    ) -> RunStatus {
        self.drain_inflight(nodes, inflight, running_drivers).await;
        self.finish(RunStatus::Canceled, None).await;
        RunStatus::Canceled
    }

    /// Abort drivers, give them the grace period to acknowledge, then
    /// force-terminate and mark whatever never reached a terminal state
    /// as canceled.
    async fn drain_inflight(
        &self,
        nodes: &mut FxHashMap<String, NodeRuntime>,
        inflight: &mut JoinSet<(String, ExecOutcome)>,
        running_drivers: &mut FxHashMap<String, Arc<dyn Driver>>,
    ) {
        self.abort_running(running_drivers).await;

        let deadline = Instant::now() + self.config.cancel_grace;
        loop {
            let joined = tokio::select! {
                joined = inflight.join_next() => joined,
                _ = tokio::time::sleep_until(deadline) => {
                    inflight.abort_all();
                    while inflight.join_next().await.is_some() {}
                    break;
                }
            };
            match joined {
                None => break,
                Some(Ok((node_id, outcome))) => {
                    running_drivers.remove(&node_id);
                    // A driver that finished before observing the abort
                    // still gets its real verdict recorded; first writer
                    // wins.
                    let mut ignored = None;
                    if let Err(err) = self.settle(nodes, &node_id, outcome, &mut ignored).await {
                        tracing::warn!(error = %err, "state write failed during cancel drain");
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "node task aborted during cancel drain");
                }
            }
        }

        // Everything not yet terminal — never started, still running past
        // grace — is canceled.
        let leftovers: Vec<String> = self
            .plan
            .nodes()
            .filter(|spec| !nodes[&spec.id].state.status.is_terminal())
            .map(|spec| spec.id.clone())
            .collect();
        for node_id in leftovers {
            if let Err(err) = self
                .mark_node(nodes, &node_id, NodeStatus::Canceled, None)
                .await
            {
                tracing::warn!(error = %err, "state write failed while canceling node");
            }
        }
    }

    /// All nodes terminal, no failure: succeeded iff every node succeeded.
    async fn conclude(&self, nodes: &FxHashMap<String, NodeRuntime>) -> RunStatus {
        let all_succeeded = nodes
            .values()
            .all(|rt| rt.state.status == NodeStatus::Succeeded);
        if all_succeeded {
            self.finish(RunStatus::Succeeded, None).await;
            RunStatus::Succeeded
        } else {
            // Nodes were canceled by an unsatisfiable-dependency sweep
            // without an explicit driver failure.
            self.finish_failed(RunError::new(
                ErrorKind::Internal,
                "one or more nodes did not succeed",
            ))
            .await
        }
    }

    async fn finish_failed(&self, error: RunError) -> RunStatus {
        self.finish(RunStatus::Failed, Some(error)).await;
        RunStatus::Failed
    }

    /// Terminal sequence: event first, CAS second, then close the log so
    /// cursors become finite. A CAS conflict here means another writer
    /// already finished the run; the stream keeps the first writer's
    /// verdict.
    async fn finish(&self, status: RunStatus, error: Option<RunError>) {
        self.emit(EventKind::Status, payload::status(status, error.as_ref()));
        let result = self
            .store
            .update_status(
                &self.run_id,
                RunStatus::Running,
                status,
                error.map(|e| e.to_string()),
            )
            .await;
        if let Err(err) = result {
            if err.is_conflict() {
                tracing::debug!(run_id = %self.run_id, error = %err, "terminal CAS lost a race");
            } else {
                tracing::error!(run_id = %self.run_id, error = %err, "terminal status write failed");
            }
        }
        self.events.close(&self.run_id);
    }

    fn emit(&self, kind: EventKind, payload: Value) {
        if let Err(err) = self.events.append(&self.run_id, kind, payload) {
            tracing::warn!(run_id = %self.run_id, error = %err, "event append failed");
        }
    }

    /// Store writes retried per the backend error policy before they
    /// surface.
    async fn put_node_state_retrying(&self, state: &NodeState) -> Result<(), StoreError> {
        let mut delay = Duration::from_millis(100);
        for attempt in 1..=BACKEND_ATTEMPTS {
            match self.store.put_node_state(state.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt == BACKEND_ATTEMPTS => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        run_id = %self.run_id,
                        node_id = %state.node_id,
                        error = %err,
                        attempt,
                        "node state write failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        unreachable!("loop returns on final attempt")
    }
}
