//! Process-wide run registry and lifecycle.
//!
//! [`RunManager`] is the single owner of the set of runs: it validates and
//! persists new plans, launches one [`Scheduler`] task per started run,
//! routes cancellation to the owning task's token, and applies
//! back-pressure through a global semaphore of `max_concurrent_runs`
//! permits. It is constructed explicitly and shared as an `Arc` — no
//! ambient globals.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::driver::DriverSet;
use crate::event_log::{EventLog, payload};
use crate::plan::{CompiledPlan, Plan, PlanError};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::store::{NodeState, Run, RunStore, StoreError};
use crate::types::{ErrorKind, EventKind, RunError, RunMode, RunStatus};

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub max_concurrent_runs: usize,
    pub scheduler: SchedulerConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 64,
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Caller-supplied knobs for run creation.
#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    /// Explicit run id; a v4 UUID is minted when absent.
    pub id: Option<String>,
    pub mode: Option<RunMode>,
    pub metadata: Value,
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("invalid plan: {0}")]
    Validation(#[from] PlanError),

    #[error("run {id} already reached terminal status {status}")]
    AlreadyTerminal { id: String, status: RunStatus },

    #[error("run {id} is active; cancel it before deleting")]
    RunActive { id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ManagerError {
    /// Classification for control-plane mapping.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::AlreadyTerminal { .. } | Self::RunActive { .. } => ErrorKind::Conflict,
            Self::Store(StoreError::NotFound { .. }) => ErrorKind::NotFound,
            Self::Store(StoreError::Backend(_)) => ErrorKind::Backend,
            Self::Store(StoreError::NotImplemented) => ErrorKind::Internal,
            Self::Store(_) => ErrorKind::Conflict,
        }
    }
}

struct RunHandle {
    cancel: CancellationToken,
}

/// Registry and lifecycle owner for all runs in this process.
pub struct RunManager {
    store: Arc<dyn RunStore>,
    events: Arc<EventLog>,
    drivers: Arc<DriverSet>,
    config: ManagerConfig,
    slots: Arc<Semaphore>,
    active: Arc<DashMap<String, RunHandle>>,
}

impl RunManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn RunStore>,
        events: Arc<EventLog>,
        drivers: Arc<DriverSet>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_runs));
        Arc::new(Self {
            store,
            events,
            drivers,
            config,
            slots,
            active: Arc::new(DashMap::new()),
        })
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    /// Validate the plan and persist a `queued` run. Creation never blocks
    /// on capacity; only `start` waits for a slot.
    #[instrument(skip(self, plan, opts), err)]
    pub async fn create(&self, plan: Plan, opts: CreateOptions) -> Result<Run, ManagerError> {
        CompiledPlan::compile(&plan)?;
        let id = opts.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let run = Run::new(
            id,
            Arc::new(plan),
            opts.mode.unwrap_or_default(),
            opts.metadata,
        );
        let run = self.store.create(run).await?;
        self.events.register(&run.id);
        tracing::info!(run_id = %run.id, mode = %run.mode, "run created");
        Ok(run)
    }

    /// Transition a queued run to `running` and hand it to a scheduler
    /// task. Blocks while the process is at `max_concurrent_runs`.
    ///
    /// Returns the run plus whether this call actually started it; a
    /// non-queued run is reported as-is with `started = false`.
    #[instrument(skip(self), err)]
    pub async fn start(&self, run_id: &str) -> Result<(Run, bool), ManagerError> {
        let run = self.store.get(run_id).await?;
        if run.status != RunStatus::Queued {
            return Ok((run, false));
        }

        // Re-validate before claiming the transition; a plan that fails to
        // compile must never leave the run stranded in `running`.
        let plan = CompiledPlan::compile(&run.plan)?;

        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .expect("run slot semaphore never closes");

        let run = match self
            .store
            .update_status(run_id, RunStatus::Queued, RunStatus::Running, None)
            .await
        {
            Ok(run) => run,
            Err(err) if err.is_conflict() => {
                // Lost the race to another starter or a cancel; report
                // what is there now.
                drop(permit);
                return Ok((self.store.get(run_id).await?, false));
            }
            Err(err) => return Err(err.into()),
        };

        let _ = self.events.append(
            run_id,
            EventKind::Status,
            payload::status(RunStatus::Running, None),
        );

        let cancel = CancellationToken::new();
        self.active.insert(
            run_id.to_string(),
            RunHandle {
                cancel: cancel.clone(),
            },
        );

        let scheduler = Scheduler::new(
            run_id.to_string(),
            plan,
            run.mode,
            Arc::clone(&self.store),
            Arc::clone(&self.events),
            Arc::clone(&self.drivers),
            self.config.scheduler.clone(),
            cancel,
        );

        let store = Arc::clone(&self.store);
        let events = Arc::clone(&self.events);
        let active = Arc::clone(&self.active);
        let owned_id = run_id.to_string();
        tokio::spawn(async move {
            // The inner spawn isolates scheduler panics so the watchdog
            // can still emit the terminal event.
            let result = tokio::spawn(scheduler.run()).await;
            match result {
                Ok(status) => {
                    tracing::info!(run_id = %owned_id, %status, "run finished");
                }
                Err(join_err) => {
                    tracing::error!(run_id = %owned_id, error = %join_err, "scheduler task died");
                    let error = RunError::new(ErrorKind::Internal, "scheduler task panicked");
                    // Skip the event when the scheduler already appended
                    // its terminal one before dying.
                    let already_terminal = events
                        .current_status(&owned_id)
                        .map(|status| status.is_terminal())
                        .unwrap_or(true);
                    if !already_terminal {
                        let _ = events.append(
                            &owned_id,
                            EventKind::Status,
                            payload::status(RunStatus::Failed, Some(&error)),
                        );
                    }
                    let _ = store
                        .update_status(
                            &owned_id,
                            RunStatus::Running,
                            RunStatus::Failed,
                            Some(error.to_string()),
                        )
                        .await;
                    events.close(&owned_id);
                }
            }
            active.remove(&owned_id);
            drop(permit);
        });

        Ok((run, true))
    }

    /// Request cancellation. Never blocks on the run reaching terminal:
    /// the accepted request is observable as the `status(canceled)` event
    /// on the stream.
    ///
    /// Idempotent for already-canceled runs; canceling a `succeeded` or
    /// `failed` run is a conflict.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, run_id: &str) -> Result<Run, ManagerError> {
        let run = self.store.get(run_id).await?;
        match run.status {
            RunStatus::Canceled => Ok(run),
            RunStatus::Succeeded | RunStatus::Failed => Err(ManagerError::AlreadyTerminal {
                id: run_id.to_string(),
                status: run.status,
            }),
            RunStatus::Queued => {
                match self
                    .store
                    .update_status(run_id, RunStatus::Queued, RunStatus::Canceled, None)
                    .await
                {
                    Ok(run) => {
                        // No scheduler owns a queued run, so the manager
                        // writes its (only) status event and seals the log.
                        let _ = self.events.append(
                            run_id,
                            EventKind::Status,
                            payload::status(RunStatus::Canceled, None),
                        );
                        self.events.close(run_id);
                        Ok(run)
                    }
                    Err(err) if err.is_conflict() => {
                        // Raced a start; retry against the now-running run.
                        Box::pin(self.cancel(run_id)).await
                    }
                    Err(err) => Err(err.into()),
                }
            }
            RunStatus::Running => {
                if let Some(handle) = self.active.get(run_id) {
                    handle.cancel.cancel();
                    return Ok(run);
                }
                // Running but unowned (e.g. recovered store from a previous
                // process): reconcile directly.
                match self
                    .store
                    .update_status(run_id, RunStatus::Running, RunStatus::Canceled, None)
                    .await
                {
                    Ok(run) => {
                        let _ = self.events.append(
                            run_id,
                            EventKind::Status,
                            payload::status(RunStatus::Canceled, None),
                        );
                        self.events.close(run_id);
                        Ok(run)
                    }
                    Err(err) if err.is_conflict() => Ok(self.store.get(run_id).await?),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    pub async fn get(&self, run_id: &str) -> Result<Run, ManagerError> {
        Ok(self.store.get(run_id).await?)
    }

    pub async fn list(&self) -> Result<Vec<Run>, ManagerError> {
        Ok(self.store.list().await?)
    }

    pub async fn node_states(&self, run_id: &str) -> Result<Vec<NodeState>, ManagerError> {
        Ok(self.store.node_states(run_id).await?)
    }

    /// Soft-delete a run and drop its event log. Active runs must be
    /// canceled first.
    #[instrument(skip(self), err)]
    pub async fn delete(&self, run_id: &str) -> Result<(), ManagerError> {
        if self.active.contains_key(run_id) {
            return Err(ManagerError::RunActive {
                id: run_id.to_string(),
            });
        }
        self.store.delete(run_id).await?;
        self.events.remove(run_id);
        Ok(())
    }

    /// Operator purge: delete terminal runs older than `ttl`. Backends
    /// without `list` support are skipped.
    pub async fn purge_finished(&self, ttl: Duration) -> Result<usize, ManagerError> {
        let runs = match self.store.list().await {
            Ok(runs) => runs,
            Err(StoreError::NotImplemented) => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let now = chrono::Utc::now();
        let mut purged = 0;
        for run in runs {
            if !run.status.is_terminal() {
                continue;
            }
            let Some(finished_at) = run.finished_at else {
                continue;
            };
            if now.signed_duration_since(finished_at) < ttl {
                continue;
            }
            match self.delete(&run.id).await {
                Ok(()) => purged += 1,
                Err(err) => {
                    tracing::warn!(run_id = %run.id, error = %err, "purge failed for run")
                }
            }
        }
        Ok(purged)
    }

    /// Number of runs currently owned by a scheduler task.
    #[must_use]
    pub fn active_runs(&self) -> usize {
        self.active.len()
    }
}
