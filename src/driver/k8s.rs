use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, LogParams, PostParams};
use kube::{Api, Client};
use serde_json::Value;

use super::{Driver, DriverContext, ExecOutcome};
use crate::plan::NodeSpec;

/// Label keys stamped on every Job this driver creates.
pub const RUN_LABEL: &str = "mentatlab/run";
pub const NODE_LABEL: &str = "mentatlab/node";

const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// How long the status poll may keep failing before the attempt is
/// declared transiently lost (watch reconnect budget).
const RECONNECT_WINDOW: Duration = Duration::from_secs(10);

/// Runs a node as a Kubernetes Job.
///
/// The node's `agent_ref` is the container image. The Job carries the run
/// and node labels so state reflection and log aggregation can find it,
/// and `backoffLimit: 0` so the engine's own retry policy is the only one
/// in play. Nodes with a `params.schedule` cron expression become a
/// CronJob with `concurrencyPolicy: Forbid` instead of an immediate Job.
pub struct KubeJobDriver {
    jobs: Api<Job>,
    cronjobs: Api<CronJob>,
    pods: Api<Pod>,
}

impl KubeJobDriver {
    /// Connect using the ambient kubeconfig / in-cluster environment.
    pub async fn connect(namespace: &str) -> Result<Self, kube::Error> {
        let client = Client::try_default().await?;
        Ok(Self::with_client(client, namespace))
    }

    #[must_use]
    pub fn with_client(client: Client, namespace: &str) -> Self {
        Self {
            jobs: Api::namespaced(client.clone(), namespace),
            cronjobs: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client, namespace),
        }
    }

    /// RFC 1123 resource name for one node attempt.
    fn job_name(run_id: &str, node_id: &str, attempt: u32) -> String {
        let sanitize = |raw: &str| -> String {
            raw.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_lowercase()
                    } else {
                        '-'
                    }
                })
                .collect::<String>()
                .trim_matches('-')
                .to_string()
        };
        let mut name = format!(
            "run-{}-{}-a{attempt}",
            sanitize(run_id),
            sanitize(node_id)
        );
        name.truncate(63);
        name.trim_end_matches('-').to_string()
    }

    fn selector(run_id: &str, node_id: &str) -> String {
        format!("{RUN_LABEL}={run_id},{NODE_LABEL}={node_id}")
    }

    fn pod_template(ctx: &DriverContext, node: &NodeSpec, image: &str, inputs: &Value) -> Value {
        let args = node
            .params
            .get("args")
            .cloned()
            .unwrap_or(Value::Array(vec![]));
        serde_json::json!({
            "metadata": {
                "labels": { RUN_LABEL: ctx.run_id, NODE_LABEL: ctx.node_id }
            },
            "spec": {
                "restartPolicy": "Never",
                "containers": [{
                    "name": "agent",
                    "image": image,
                    "args": args,
                    "env": [
                        { "name": "MENTAT_RUN_ID", "value": ctx.run_id },
                        { "name": "MENTAT_NODE_ID", "value": ctx.node_id },
                        { "name": "MENTAT_PARAMS", "value": Value::Object(node.params.clone()).to_string() },
                        { "name": "MENTAT_INPUTS", "value": inputs.to_string() },
                    ],
                }]
            }
        })
    }

    /// Terminal verdict from Job conditions, if any.
    fn job_verdict(job: &Job) -> Option<ExecOutcome> {
        let conditions = job.status.as_ref()?.conditions.as_ref()?;
        for condition in conditions {
            if condition.status != "True" {
                continue;
            }
            match condition.type_.as_str() {
                "Complete" => {
                    let mut outputs = serde_json::Map::new();
                    outputs.insert(
                        "job".to_string(),
                        Value::from(job.metadata.name.clone().unwrap_or_default()),
                    );
                    return Some(ExecOutcome::success(outputs));
                }
                "Failed" => {
                    let message = condition
                        .message
                        .clone()
                        .unwrap_or_else(|| "job failed".to_string());
                    return Some(ExecOutcome::permanent(message));
                }
                _ => {}
            }
        }
        None
    }

    async fn create_cronjob(
        &self,
        ctx: &DriverContext,
        node: &NodeSpec,
        image: &str,
        schedule: &str,
        inputs: &Value,
    ) -> ExecOutcome {
        let name = Self::job_name(&ctx.run_id, &ctx.node_id, 0);
        let cronjob: CronJob = match serde_json::from_value(serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "CronJob",
            "metadata": {
                "name": name,
                "labels": { RUN_LABEL: ctx.run_id, NODE_LABEL: ctx.node_id }
            },
            "spec": {
                "schedule": schedule,
                "concurrencyPolicy": "Forbid",
                "jobTemplate": {
                    "spec": {
                        "backoffLimit": 0,
                        "template": Self::pod_template(ctx, node, image, inputs),
                    }
                }
            }
        })) {
            Ok(cronjob) => cronjob,
            Err(err) => return ExecOutcome::permanent(format!("invalid cronjob spec: {err}")),
        };

        match self.cronjobs.create(&PostParams::default(), &cronjob).await {
            Ok(created) => {
                let mut outputs = serde_json::Map::new();
                outputs.insert(
                    "cron_job".to_string(),
                    Value::from(created.metadata.name.unwrap_or(name)),
                );
                ExecOutcome::success(outputs)
            }
            Err(kube::Error::Api(response)) if response.code == 409 => {
                // A previous attempt already installed the schedule.
                let mut outputs = serde_json::Map::new();
                outputs.insert("cron_job".to_string(), Value::from(name));
                ExecOutcome::success(outputs)
            }
            Err(err) => ExecOutcome::transient(format!("cronjob create failed: {err}")),
        }
    }
}

#[async_trait]
impl Driver for KubeJobDriver {
    async fn execute(
        &self,
        ctx: DriverContext,
        node: &NodeSpec,
        inputs: serde_json::Map<String, Value>,
    ) -> ExecOutcome {
        let Some(image) = node.agent_ref.as_deref() else {
            return ExecOutcome::permanent(format!("node {} declares no agent_ref", node.id));
        };
        let inputs = Value::Object(inputs);

        if let Some(schedule) = node.params.get("schedule").and_then(Value::as_str) {
            return self
                .create_cronjob(&ctx, node, image, schedule, &inputs)
                .await;
        }

        let name = Self::job_name(&ctx.run_id, &ctx.node_id, ctx.attempt);
        let job: Job = match serde_json::from_value(serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": name,
                "labels": { RUN_LABEL: ctx.run_id, NODE_LABEL: ctx.node_id }
            },
            "spec": {
                "backoffLimit": 0,
                "template": Self::pod_template(&ctx, node, image, &inputs),
            }
        })) {
            Ok(job) => job,
            Err(err) => return ExecOutcome::permanent(format!("invalid job spec: {err}")),
        };

        if let Err(err) = self.jobs.create(&PostParams::default(), &job).await {
            return match err {
                kube::Error::Api(response) if response.code == 409 => {
                    // Stale object from an interrupted earlier attempt;
                    // clear it and let the retry recreate.
                    let _ = self.jobs.delete(&name, &DeleteParams::background()).await;
                    ExecOutcome::transient("stale job object removed; retrying")
                }
                err => ExecOutcome::transient(format!("job create failed: {err}")),
            };
        }

        let mut last_poll_ok = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    let _ = self.jobs.delete(&name, &DeleteParams::background()).await;
                    return ExecOutcome::Canceled;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    match self.jobs.get_status(&name).await {
                        Ok(job) => {
                            last_poll_ok = tokio::time::Instant::now();
                            if let Some(verdict) = Self::job_verdict(&job) {
                                return verdict;
                            }
                        }
                        Err(err) => {
                            if last_poll_ok.elapsed() > RECONNECT_WINDOW {
                                return ExecOutcome::transient(format!(
                                    "lost contact with job {name}: {err}"
                                ));
                            }
                            tracing::warn!(job = %name, error = %err, "job status poll failed; retrying");
                        }
                    }
                }
            }
        }
    }

    async fn abort(&self, run_id: &str, node_id: &str) {
        let params = ListParams::default().labels(&Self::selector(run_id, node_id));
        if let Err(err) = self
            .jobs
            .delete_collection(&DeleteParams::background(), &params)
            .await
        {
            tracing::debug!(
                run_id,
                node_id,
                error = %err,
                "job delete_collection failed during abort"
            );
        }
    }

    async fn logs(&self, run_id: &str, node_id: &str, tail: Option<usize>) -> Vec<String> {
        let params = ListParams::default().labels(&Self::selector(run_id, node_id));
        let Ok(pods) = self.pods.list(&params).await else {
            return Vec::new();
        };
        let mut lines = Vec::new();
        for pod in pods {
            let Some(name) = pod.metadata.name else {
                continue;
            };
            let log_params = LogParams {
                tail_lines: tail.map(|t| t as i64),
                ..LogParams::default()
            };
            match self.pods.logs(&name, &log_params).await {
                Ok(raw) => lines.extend(raw.lines().map(str::to_string)),
                Err(err) => {
                    tracing::debug!(pod = %name, error = %err, "pod log fetch failed");
                }
            }
        }
        if let Some(tail) = tail {
            if lines.len() > tail {
                lines.drain(..lines.len() - tail);
            }
        }
        lines
    }
}
