use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde_json::Value;
use uuid::Uuid;

use super::{Driver, DriverContext, ExecOutcome};
use crate::plan::NodeSpec;

/// How long an abort marker stays visible to workers.
const CANCEL_MARKER_TTL_SECS: u64 = 60;

/// Dispatches node work to external workers over Redis lists.
///
/// The task envelope is pushed onto `queue:{agent_ref}`; a worker is
/// expected to pop it, execute, and leave a JSON result under
/// `result:{task_id}` (with its own TTL). The driver polls that key until
/// `result_wait` elapses. A queue that cannot be reached is a transient
/// failure: the scheduler's retry/backoff owns recovery.
///
/// Result envelope: `{ "ok": bool, "outputs"?: object, "error"?: string,
/// "retriable"?: bool }`.
pub struct RedisTaskDriver {
    conn: ConnectionManager,
    result_wait: Duration,
    poll_interval: Duration,
    inflight: DashMap<(String, String), String>,
}

impl RedisTaskDriver {
    /// Connect using a `redis://` URL.
    pub async fn connect(url: &str, result_wait: Duration) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::from_manager(conn, result_wait))
    }

    #[must_use]
    pub fn from_manager(conn: ConnectionManager, result_wait: Duration) -> Self {
        Self {
            conn,
            result_wait,
            poll_interval: Duration::from_millis(500),
            inflight: DashMap::new(),
        }
    }

    fn parse_result(raw: &str) -> ExecOutcome {
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return ExecOutcome::permanent("worker returned unparseable result");
        };
        let ok = value.get("ok").and_then(Value::as_bool).unwrap_or(false);
        if ok {
            let outputs = value
                .get("outputs")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            return ExecOutcome::success(outputs);
        }
        let message = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("worker reported failure")
            .to_string();
        if value
            .get("retriable")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            ExecOutcome::transient(message)
        } else {
            ExecOutcome::permanent(message)
        }
    }
}

#[async_trait]
impl Driver for RedisTaskDriver {
    async fn execute(
        &self,
        ctx: DriverContext,
        node: &NodeSpec,
        inputs: serde_json::Map<String, Value>,
    ) -> ExecOutcome {
        let Some(agent_ref) = node.agent_ref.as_deref() else {
            return ExecOutcome::permanent(format!("node {} declares no agent_ref", node.id));
        };

        let task_id = Uuid::new_v4().to_string();
        let envelope = serde_json::json!({
            "task_id": task_id,
            "run_id": ctx.run_id,
            "node_id": ctx.node_id,
            "attempt": ctx.attempt,
            "params": node.params,
            "inputs": inputs,
        });

        let key = (ctx.run_id.clone(), ctx.node_id.clone());
        self.inflight.insert(key.clone(), task_id.clone());

        let mut conn = self.conn.clone();
        let push: Result<(), redis::RedisError> = conn
            .lpush(format!("queue:{agent_ref}"), envelope.to_string())
            .await;
        if let Err(err) = push {
            self.inflight.remove(&key);
            return ExecOutcome::transient(format!("queue unreachable: {err}"));
        }

        let result_key = format!("result:{task_id}");
        let deadline = tokio::time::Instant::now() + self.result_wait;
        let outcome = loop {
            if tokio::time::Instant::now() >= deadline {
                break ExecOutcome::transient(format!(
                    "no result for task {task_id} within {:?}",
                    self.result_wait
                ));
            }
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    // Leave a marker so a worker that picks the task up
                    // later knows not to bother.
                    let _: Result<(), redis::RedisError> = conn
                        .set_ex(format!("cancel:{task_id}"), 1, CANCEL_MARKER_TTL_SECS)
                        .await;
                    break ExecOutcome::Canceled;
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    match conn.get::<_, Option<String>>(&result_key).await {
                        Ok(Some(raw)) => break Self::parse_result(&raw),
                        Ok(None) => continue,
                        Err(err) => {
                            tracing::warn!(
                                task_id = %task_id,
                                error = %err,
                                "result poll failed; retrying until deadline"
                            );
                        }
                    }
                }
            }
        };

        self.inflight.remove(&key);
        outcome
    }

    async fn abort(&self, run_id: &str, node_id: &str) {
        let Some(task_id) = self
            .inflight
            .get(&(run_id.to_string(), node_id.to_string()))
            .map(|entry| entry.value().clone())
        else {
            return;
        };
        let mut conn = self.conn.clone();
        let set: Result<(), redis::RedisError> = conn
            .set_ex(format!("cancel:{task_id}"), 1, CANCEL_MARKER_TTL_SECS)
            .await;
        if let Err(err) = set {
            tracing::debug!(task_id = %task_id, error = %err, "abort marker write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worker_results() {
        match RedisTaskDriver::parse_result(r#"{"ok":true,"outputs":{"text":"hi"}}"#) {
            ExecOutcome::Ok { outputs } => assert_eq!(outputs["text"], "hi"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            RedisTaskDriver::parse_result(r#"{"ok":false,"error":"busy","retriable":true}"#),
            ExecOutcome::Fail { retriable: true, .. }
        ));
        assert!(matches!(
            RedisTaskDriver::parse_result("not json"),
            ExecOutcome::Fail { retriable: false, .. }
        ));
    }
}
