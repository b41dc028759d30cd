use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rustc_hash::FxHashMap;

use super::{NodeState, Run, RunStore, StoreError, apply_transition};
use crate::types::RunStatus;

struct MemoryRecord {
    run: Run,
    nodes: FxHashMap<String, NodeState>,
    deleted_at: Option<DateTime<Utc>>,
}

/// Process-local store backed by a concurrent map. State is lost on
/// restart; intended for development and tests.
///
/// CAS atomicity comes from holding the per-run entry guard across the
/// compare and the write.
#[derive(Default)]
pub struct MemoryRunStore {
    records: DashMap<String, MemoryRecord>,
}

impl MemoryRunStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop soft-deleted records for real. Returns how many were purged.
    pub fn purge_deleted(&self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.deleted_at.is_none());
        before - self.records.len()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create(&self, run: Run) -> Result<Run, StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.records.entry(run.id.clone()) {
            Entry::Occupied(entry) if entry.get().deleted_at.is_none() => {
                Err(StoreError::AlreadyExists { id: run.id })
            }
            Entry::Occupied(mut entry) => {
                // Reusing a soft-deleted id replaces the tombstone.
                entry.insert(MemoryRecord {
                    run: run.clone(),
                    nodes: FxHashMap::default(),
                    deleted_at: None,
                });
                Ok(run)
            }
            Entry::Vacant(entry) => {
                entry.insert(MemoryRecord {
                    run: run.clone(),
                    nodes: FxHashMap::default(),
                    deleted_at: None,
                });
                Ok(run)
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Run, StoreError> {
        self.records
            .get(id)
            .filter(|record| record.deleted_at.is_none())
            .map(|record| record.run.clone())
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn list(&self) -> Result<Vec<Run>, StoreError> {
        let mut runs: Vec<Run> = self
            .records
            .iter()
            .filter(|record| record.deleted_at.is_none())
            .map(|record| record.run.clone())
            .collect();
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
        let mut record = self
            .records
            .get_mut(id)
            .filter(|record| record.deleted_at.is_none())
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        apply_transition(&mut record.run, expected, next, error)?;
        Ok(record.run.clone())
    }

    async fn put_node_state(&self, state: NodeState) -> Result<(), StoreError> {
        let mut record = self
            .records
            .get_mut(&state.run_id)
            .filter(|record| record.deleted_at.is_none())
            .ok_or_else(|| StoreError::NotFound {
                id: state.run_id.clone(),
            })?;
        record.nodes.insert(state.node_id.clone(), state);
        Ok(())
    }

    async fn node_states(&self, run_id: &str) -> Result<Vec<NodeState>, StoreError> {
        let record = self
            .records
            .get(run_id)
            .filter(|record| record.deleted_at.is_none())
            .ok_or_else(|| StoreError::NotFound {
                id: run_id.to_string(),
            })?;
        let mut states: Vec<NodeState> = record.nodes.values().cloned().collect();
        states.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(states)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        record.deleted_at = Some(Utc::now());
        Ok(())
    }
}
