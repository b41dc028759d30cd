use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;

use super::{NodeState, Run, RunStore, StoreError};
use crate::plan::Plan;
use crate::types::{NodeStatus, RunMode, RunStatus};

/// Terminal runs linger for a day before Redis expires them.
const FINISHED_RUN_TTL_SECS: i64 = 86_400;

/// Compare-and-set on the run hash's `status` field, with lifecycle
/// timestamp and error stamped in the same atomic step. Returns `"ok"`,
/// `"missing"`, or the status actually found.
const CAS_SCRIPT: &str = r#"
local cur = redis.call('HGET', KEYS[1], 'status')
if not cur then return 'missing' end
if cur ~= ARGV[1] then return cur end
redis.call('HSET', KEYS[1], 'status', ARGV[2])
if ARGV[3] ~= '' then redis.call('HSET', KEYS[1], ARGV[3], ARGV[4]) end
if ARGV[5] ~= '' then redis.call('HSET', KEYS[1], 'error', ARGV[5]) end
return 'ok'
"#;

/// Redis-backed store.
///
/// Layout:
///
/// ```text
/// runs                     set of run ids
/// run:{id}                 hash (id, plan, mode, status, metadata, timestamps, error)
/// run:{id}:nodes           set of node ids
/// run:{id}:node:{nid}      hash (status, attempt, timestamps, error, output)
/// ```
///
/// Writes are atomic per key; the CAS transition runs as a Lua script.
/// Cross-key consistency relies on the engine's append-event-first
/// ordering, so an interrupted write sequence is always recoverable from
/// the event stream.
pub struct RedisRunStore {
    conn: ConnectionManager,
    cas: Script,
}

impl RedisRunStore {
    /// Connect using a `redis://` URL. The connection manager reconnects
    /// transparently on broken connections.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::backend)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(StoreError::backend)?;
        Ok(Self {
            conn,
            cas: Script::new(CAS_SCRIPT),
        })
    }

    fn run_key(id: &str) -> String {
        format!("run:{id}")
    }

    fn nodes_key(id: &str) -> String {
        format!("run:{id}:nodes")
    }

    fn node_key(run_id: &str, node_id: &str) -> String {
        format!("run:{run_id}:node:{node_id}")
    }

    fn run_fields(run: &Run) -> Result<Vec<(&'static str, String)>, StoreError> {
        let mut fields = vec![
            ("id", run.id.clone()),
            (
                "plan",
                serde_json::to_string(run.plan.as_ref()).map_err(StoreError::backend)?,
            ),
            ("mode", run.mode.to_string()),
            ("status", run.status.to_string()),
            (
                "metadata",
                serde_json::to_string(&run.metadata).map_err(StoreError::backend)?,
            ),
            ("created_at", run.created_at.to_rfc3339()),
        ];
        if let Some(at) = run.started_at {
            fields.push(("started_at", at.to_rfc3339()));
        }
        if let Some(at) = run.finished_at {
            fields.push(("finished_at", at.to_rfc3339()));
        }
        if let Some(error) = &run.error {
            fields.push(("error", error.clone()));
        }
        Ok(fields)
    }

    fn parse_timestamp(raw: Option<&String>) -> Option<DateTime<Utc>> {
        raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn run_from_hash(id: &str, hash: &HashMap<String, String>) -> Result<Run, StoreError> {
        let field = |name: &str| {
            hash.get(name).cloned().ok_or_else(|| {
                StoreError::Backend(format!("run {id} hash missing field {name}").into())
            })
        };
        let plan: Plan = serde_json::from_str(&field("plan")?).map_err(StoreError::backend)?;
        let mode: RunMode = field("mode")?.parse().map_err(StoreError::backend)?;
        let status: RunStatus = field("status")?.parse().map_err(StoreError::backend)?;
        let metadata = hash
            .get("metadata")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(serde_json::Value::Null);
        Ok(Run {
            id: id.to_string(),
            plan: Arc::new(plan),
            mode,
            status,
            metadata,
            created_at: Self::parse_timestamp(hash.get("created_at")).unwrap_or_else(Utc::now),
            started_at: Self::parse_timestamp(hash.get("started_at")),
            finished_at: Self::parse_timestamp(hash.get("finished_at")),
            error: hash.get("error").cloned(),
        })
    }

    fn node_from_hash(
        run_id: &str,
        node_id: &str,
        hash: &HashMap<String, String>,
    ) -> Result<NodeState, StoreError> {
        let status: NodeStatus = hash
            .get("status")
            .ok_or_else(|| {
                StoreError::Backend(format!("node {run_id}/{node_id} missing status").into())
            })?
            .parse()
            .map_err(StoreError::backend)?;
        Ok(NodeState {
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            status,
            attempt: hash
                .get("attempt")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(1),
            started_at: Self::parse_timestamp(hash.get("started_at")),
            finished_at: Self::parse_timestamp(hash.get("finished_at")),
            error: hash.get("error").cloned(),
            output: hash
                .get("output")
                .and_then(|raw| serde_json::from_str(raw).ok()),
        })
    }

    async fn fetch_run(&self, id: &str) -> Result<Run, StoreError> {
        let mut conn = self.conn.clone();
        let hash: HashMap<String, String> = conn
            .hgetall(Self::run_key(id))
            .await
            .map_err(StoreError::backend)?;
        if hash.is_empty() || hash.contains_key("deleted_at") {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        Self::run_from_hash(id, &hash)
    }

    async fn expire_run(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let node_ids: Vec<String> = conn
            .smembers(Self::nodes_key(id))
            .await
            .map_err(StoreError::backend)?;
        let mut pipe = redis::pipe();
        pipe.expire(Self::run_key(id), FINISHED_RUN_TTL_SECS)
            .expire(Self::nodes_key(id), FINISHED_RUN_TTL_SECS);
        for node_id in &node_ids {
            pipe.expire(Self::node_key(id, node_id), FINISHED_RUN_TTL_SECS);
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for RedisRunStore {
    async fn create(&self, run: Run) -> Result<Run, StoreError> {
        let mut conn = self.conn.clone();
        let key = Self::run_key(&run.id);
        // HSETNX on the id field is the existence check; the remaining
        // fields land right after on the same key.
        let fresh: bool = conn
            .hset_nx(&key, "id", &run.id)
            .await
            .map_err(StoreError::backend)?;
        if !fresh {
            return Err(StoreError::AlreadyExists { id: run.id });
        }
        let fields = Self::run_fields(&run)?;
        let mut pipe = redis::pipe();
        pipe.hset_multiple(&key, &fields).sadd("runs", &run.id);
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(StoreError::backend)?;
        Ok(run)
    }

    async fn get(&self, id: &str) -> Result<Run, StoreError> {
        self.fetch_run(id).await
    }

    async fn list(&self) -> Result<Vec<Run>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers("runs").await.map_err(StoreError::backend)?;
        let mut runs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.fetch_run(&id).await {
                Ok(run) => runs.push(run),
                // Raced deletion/expiry between SMEMBERS and HGETALL.
                Err(StoreError::NotFound { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    async fn update_status(
        &self,
        id: &str,
        expected: RunStatus,
        next: RunStatus,
        error: Option<String>,
    ) -> Result<Run, StoreError> {
        if !expected.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: expected,
                to: next,
            });
        }
        let stamp_field = if next == RunStatus::Running {
            "started_at"
        } else if next.is_terminal() {
            "finished_at"
        } else {
            ""
        };

        let mut conn = self.conn.clone();
        let verdict: String = self
            .cas
            .key(Self::run_key(id))
            .arg(expected.as_str())
            .arg(next.as_str())
            .arg(stamp_field)
            .arg(Utc::now().to_rfc3339())
            .arg(error.as_deref().unwrap_or(""))
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::backend)?;

        match verdict.as_str() {
            "ok" => {
                if next.is_terminal() {
                    self.expire_run(id).await?;
                }
                self.fetch_run(id).await
            }
            "missing" => Err(StoreError::NotFound { id: id.to_string() }),
            found => Err(StoreError::StatusConflict {
                id: id.to_string(),
                expected,
                found: found.parse().map_err(StoreError::backend)?,
            }),
        }
    }

    async fn put_node_state(&self, state: NodeState) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = Self::node_key(&state.run_id, &state.node_id);
        let mut fields = vec![
            ("status", state.status.to_string()),
            ("attempt", state.attempt.to_string()),
        ];
        if let Some(at) = state.started_at {
            fields.push(("started_at", at.to_rfc3339()));
        }
        if let Some(at) = state.finished_at {
            fields.push(("finished_at", at.to_rfc3339()));
        }
        if let Some(error) = &state.error {
            fields.push(("error", error.clone()));
        }
        if let Some(output) = &state.output {
            fields.push((
                "output",
                serde_json::to_string(output).map_err(StoreError::backend)?,
            ));
        }
        let mut pipe = redis::pipe();
        pipe.hset_multiple(&key, &fields)
            .sadd(Self::nodes_key(&state.run_id), &state.node_id);
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn node_states(&self, run_id: &str) -> Result<Vec<NodeState>, StoreError> {
        let mut conn = self.conn.clone();
        let node_ids: Vec<String> = conn
            .smembers(Self::nodes_key(run_id))
            .await
            .map_err(StoreError::backend)?;
        let mut states = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            let hash: HashMap<String, String> = conn
                .hgetall(Self::node_key(run_id, &node_id))
                .await
                .map_err(StoreError::backend)?;
            if hash.is_empty() {
                continue;
            }
            states.push(Self::node_from_hash(run_id, &node_id, &hash)?);
        }
        states.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(states)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(Self::run_key(id))
            .await
            .map_err(StoreError::backend)?;
        if !exists {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        let mut pipe = redis::pipe();
        pipe.hset(Self::run_key(id), "deleted_at", Utc::now().to_rfc3339())
            .srem("runs", id);
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(StoreError::backend)?;
        self.expire_run(id).await
    }
}
