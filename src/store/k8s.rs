use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::api::ListParams;
use kube::{Api, Client};

use super::{MemoryRunStore, NodeState, Run, RunStore, StoreError};
use crate::driver::k8s::{NODE_LABEL, RUN_LABEL};
use crate::types::{NodeStatus, RunStatus};

/// Store for `k8s`-mode runs.
///
/// Job objects cannot carry the plan or the run record, so those live in
/// an embedded in-process store; node state is *reflected* from the live
/// Job objects labeled with the run id. All cluster writes go through the
/// K8s driver — this store never creates or mutates Jobs.
///
/// `list` is intentionally not implemented: enumerating runs from Job
/// labels alone would miss runs that have not dispatched any node yet.
/// The control plane maps the error to 501.
pub struct KubeRunStore {
    inner: MemoryRunStore,
    jobs: Api<Job>,
}

impl KubeRunStore {
    /// Connect using the ambient kubeconfig / in-cluster environment.
    pub async fn connect(namespace: &str) -> Result<Self, StoreError> {
        let client = Client::try_default().await.map_err(StoreError::backend)?;
        Ok(Self::with_client(client, namespace))
    }

    #[must_use]
    pub fn with_client(client: Client, namespace: &str) -> Self {
        Self {
            inner: MemoryRunStore::new(),
            jobs: Api::namespaced(client, namespace),
        }
    }

    /// Node status derived from a Job's conditions.
    fn reflect_status(job: &Job) -> Option<NodeStatus> {
        let status = job.status.as_ref()?;
        if let Some(conditions) = &status.conditions {
            for condition in conditions {
                if condition.status != "True" {
                    continue;
                }
                match condition.type_.as_str() {
                    "Complete" => return Some(NodeStatus::Succeeded),
                    "Failed" => return Some(NodeStatus::Failed),
                    _ => {}
                }
            }
        }
        if status.active.unwrap_or(0) > 0 {
            return Some(NodeStatus::Running);
        }
        None
    }
}

#[async_trait]
impl RunStore for KubeRunStore {
    async fn create(&self, run: Run) -> Result<Run, StoreError> {
        self.inner.create(run).await
    }

    async fn get(&self, id: &str) -> Result<Run, StoreError> {
        self.inner.get(id).await
    }

    async fn list(&self) -> Result<Vec<Run>, StoreError> {
        Err(StoreError::NotImplemented)
    }

    async fn update_status(
        &self,
        id: &str,
        expected: RunStatus,
        next: RunStatus,
        error: Option<String>,
    ) -> Result<Run, StoreError> {
        self.inner.update_status(id, expected, next, error).await
    }

    async fn put_node_state(&self, state: NodeState) -> Result<(), StoreError> {
        self.inner.put_node_state(state).await
    }

    async fn node_states(&self, run_id: &str) -> Result<Vec<NodeState>, StoreError> {
        let mut states = self.inner.node_states(run_id).await?;

        // Overlay live Job status onto the scheduler's record. The
        // scheduler's terminal verdicts win; the reflection only refines
        // in-flight state.
        let params = ListParams::default().labels(&format!("{RUN_LABEL}={run_id}"));
        let jobs = self.jobs.list(&params).await.map_err(StoreError::backend)?;
        for job in jobs {
            let Some(node_id) = job
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(NODE_LABEL))
            else {
                continue;
            };
            let Some(reflected) = Self::reflect_status(&job) else {
                continue;
            };
            if let Some(state) = states
                .iter_mut()
                .find(|state| &state.node_id == node_id && !state.status.is_terminal())
            {
                state.status = reflected;
            }
        }
        Ok(states)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }
}
