use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use super::cursor::EventCursor;
use super::event::{Event, payload};
use crate::types::{EventKind, RunStatus};

/// Broadcast buffer per run. Slow subscribers that fall further behind than
/// this re-read from the ring instead of losing events.
const TAIL_CAPACITY: usize = 1024;

/// How many events a run keeps and for how long.
///
/// An event is evicted only once it is *both* outside the count window and
/// older than the age window ("500 events or 10 minutes, whichever
/// larger"), and never while it is among the `min_replay` newest.
#[derive(Clone, Copy, Debug)]
pub struct RetentionPolicy {
    pub max_events: usize,
    pub max_age: Duration,
    pub min_replay: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_events: 500,
            max_age: Duration::from_secs(600),
            min_replay: 100,
        }
    }
}

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("unknown run: {run_id}")]
    UnknownRun { run_id: String },

    #[error("event log for run {run_id} is closed")]
    Closed { run_id: String },
}

/// Replay gap sentinel: seqs `from..=to` were evicted by retention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gap {
    pub from: u64,
    pub to: u64,
}

impl Gap {
    /// Materialize the sentinel as a synthetic event carrying the missed
    /// range. Its `seq` is the last missed seq so resume-by-id keeps
    /// working for clients that store it.
    #[must_use]
    pub fn to_event(self, run_id: &str) -> Event {
        Event {
            seq: self.to,
            run_id: run_id.to_string(),
            kind: EventKind::Gap,
            payload: payload::gap(self.from, self.to),
            ts: Utc::now(),
        }
    }
}

/// Result of a bounded range read.
#[derive(Debug, Default)]
pub struct Replay {
    pub gap: Option<Gap>,
    pub events: Vec<Arc<Event>>,
}

struct LogState {
    ring: VecDeque<Arc<Event>>,
    next_seq: u64,
    floor: u64,
    last_status: RunStatus,
    closed: bool,
}

/// A single run's ring of events plus its live tail broadcast.
pub(crate) struct RunLog {
    run_id: String,
    state: Mutex<LogState>,
    // Taken on close so subscribers observe end-of-stream (same shape as a
    // broadcast hub shutting down).
    tail: RwLock<Option<broadcast::Sender<Arc<Event>>>>,
    retention: RetentionPolicy,
}

impl RunLog {
    fn new(run_id: String, retention: RetentionPolicy) -> Self {
        let (tail, _) = broadcast::channel(TAIL_CAPACITY);
        Self {
            run_id,
            state: Mutex::new(LogState {
                ring: VecDeque::new(),
                next_seq: 1,
                floor: 1,
                last_status: RunStatus::Queued,
                closed: false,
            }),
            tail: RwLock::new(Some(tail)),
            retention,
        }
    }

    fn append(&self, kind: EventKind, payload: Value) -> Result<u64, EventLogError> {
        let event = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(EventLogError::Closed {
                    run_id: self.run_id.clone(),
                });
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            if kind == EventKind::Status {
                if let Some(status) = payload
                    .get("status")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                {
                    state.last_status = status;
                }
            }
            let event = Arc::new(Event {
                seq,
                run_id: self.run_id.clone(),
                kind,
                payload,
                ts: Utc::now(),
            });
            state.ring.push_back(Arc::clone(&event));
            Self::trim_locked(&mut state, self.retention);
            event
        };

        if let Some(tail) = self.tail.read().as_ref() {
            // No receivers is fine; events stay replayable from the ring.
            let _ = tail.send(Arc::clone(&event));
        }
        Ok(event.seq)
    }

    fn trim_locked(state: &mut LogState, retention: RetentionPolicy) {
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(retention.max_age)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 2));
        while state.ring.len() > retention.min_replay && state.ring.len() > retention.max_events {
            let Some(front) = state.ring.front() else {
                break;
            };
            if now.signed_duration_since(front.ts) < max_age {
                break;
            }
            let evicted = state.ring.pop_front().expect("front checked above");
            state.floor = evicted.seq + 1;
        }
    }

    pub(crate) fn replay(&self, after_seq: u64, limit: Option<usize>) -> Replay {
        let state = self.state.lock();
        let gap = if after_seq + 1 < state.floor {
            Some(Gap {
                from: after_seq + 1,
                to: state.floor - 1,
            })
        } else {
            None
        };
        let events: Vec<Arc<Event>> = state
            .ring
            .iter()
            .filter(|e| e.seq > after_seq)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Replay { gap, events }
    }

    fn subscribe(self: &Arc<Self>, after_seq: u64) -> EventCursor {
        // Subscribe to the tail before snapshotting the ring so nothing is
        // missed in between; the cursor dedups overlap by seq.
        let receiver = self.tail.read().as_ref().map(|tail| tail.subscribe());
        let replay = self.replay(after_seq, None);
        EventCursor::new(Arc::clone(self), replay, receiver, after_seq)
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
        }
        let _ = self.tail.write().take();
    }

    pub(crate) fn run_id(&self) -> &str {
        &self.run_id
    }

    pub(crate) fn record_lag(&self, missed: u64) {
        tracing::warn!(
            target: "mentat_orchestrator::event_log",
            run_id = %self.run_id,
            missed,
            "event cursor lagged behind the tail; re-reading from ring"
        );
    }

    fn snapshot_meta(&self) -> (u64, u64, RunStatus, bool) {
        let state = self.state.lock();
        (
            state.next_seq - 1,
            state.floor,
            state.last_status,
            state.closed,
        )
    }
}

/// Process-wide registry of per-run event logs.
///
/// A run's log is registered at creation, closed when the run reaches a
/// terminal status (after the terminal `status` event has been appended),
/// and removed when the run is purged.
pub struct EventLog {
    runs: DashMap<String, Arc<RunLog>>,
    retention: RetentionPolicy,
}

impl EventLog {
    #[must_use]
    pub fn new(retention: RetentionPolicy) -> Arc<Self> {
        Arc::new(Self {
            runs: DashMap::new(),
            retention,
        })
    }

    /// Register a run's log. Idempotent; an existing log is kept.
    pub fn register(&self, run_id: &str) {
        self.runs
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(RunLog::new(run_id.to_string(), self.retention)));
    }

    /// Drop a run's log entirely. Live cursors end after draining what they
    /// already hold.
    pub fn remove(&self, run_id: &str) {
        if let Some((_, log)) = self.runs.remove(run_id) {
            log.close();
        }
    }

    #[must_use]
    pub fn contains(&self, run_id: &str) -> bool {
        self.runs.contains_key(run_id)
    }

    fn get(&self, run_id: &str) -> Result<Arc<RunLog>, EventLogError> {
        self.runs
            .get(run_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EventLogError::UnknownRun {
                run_id: run_id.to_string(),
            })
    }

    /// Append an event, assigning the next sequence number.
    pub fn append(
        &self,
        run_id: &str,
        kind: EventKind,
        payload: Value,
    ) -> Result<u64, EventLogError> {
        self.get(run_id)?.append(kind, payload)
    }

    /// Events with `seq > after_seq`, up to `limit`, plus a gap sentinel
    /// when retention already evicted part of the requested range.
    pub fn replay(
        &self,
        run_id: &str,
        after_seq: u64,
        limit: Option<usize>,
    ) -> Result<Replay, EventLogError> {
        Ok(self.get(run_id)?.replay(after_seq, limit))
    }

    /// Tail subscription starting after `after_seq`: buffered backlog
    /// first (with gap sentinel if applicable), then live events until the
    /// log closes. Subscribing at `0` prepends the synthetic `hello`.
    pub fn subscribe(&self, run_id: &str, after_seq: u64) -> Result<EventCursor, EventLogError> {
        let log = self.get(run_id)?;
        let mut cursor = log.subscribe(after_seq);
        if after_seq == 0 {
            let (_, _, status, _) = log.snapshot_meta();
            cursor.prepend_hello(Event {
                seq: 0,
                run_id: run_id.to_string(),
                kind: EventKind::Hello,
                payload: payload::hello(run_id, status, false),
                ts: Utc::now(),
            });
        }
        Ok(cursor)
    }

    /// Apply the retention policy immediately instead of waiting for the
    /// next append.
    pub fn retention_trim(&self, run_id: &str) -> Result<(), EventLogError> {
        let log = self.get(run_id)?;
        let mut state = log.state.lock();
        RunLog::trim_locked(&mut state, log.retention);
        Ok(())
    }

    /// Mark a run's stream complete. Must be called only after the terminal
    /// `status` event was appended; subsequent appends fail.
    pub fn close(&self, run_id: &str) {
        if let Some(log) = self.runs.get(run_id) {
            log.close();
        }
    }

    /// Highest assigned seq (0 when nothing was appended yet).
    pub fn last_seq(&self, run_id: &str) -> Result<u64, EventLogError> {
        Ok(self.get(run_id)?.snapshot_meta().0)
    }

    /// Lowest seq still available for replay.
    pub fn retention_floor(&self, run_id: &str) -> Result<u64, EventLogError> {
        Ok(self.get(run_id)?.snapshot_meta().1)
    }

    /// Status carried by the most recent `status` event.
    pub fn current_status(&self, run_id: &str) -> Result<RunStatus, EventLogError> {
        Ok(self.get(run_id)?.snapshot_meta().2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_retention() -> RetentionPolicy {
        RetentionPolicy {
            max_events: 5,
            max_age: Duration::ZERO,
            min_replay: 5,
        }
    }

    #[test]
    fn seq_starts_at_one_and_is_gap_free() {
        let log = EventLog::new(RetentionPolicy::default());
        log.register("r");
        for i in 1..=10u64 {
            let seq = log
                .append("r", EventKind::Log, payload::log_line("n", "x"))
                .unwrap();
            assert_eq!(seq, i);
        }
        let replay = log.replay("r", 0, None).unwrap();
        assert!(replay.gap.is_none());
        let seqs: Vec<u64> = replay.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn trim_produces_gap_sentinel() {
        let log = EventLog::new(tiny_retention());
        log.register("r");
        for _ in 0..100 {
            log.append("r", EventKind::Log, payload::log_line("n", "x"))
                .unwrap();
        }
        assert_eq!(log.retention_floor("r").unwrap(), 96);

        let replay = log.replay("r", 1, None).unwrap();
        assert_eq!(replay.gap, Some(Gap { from: 2, to: 95 }));
        let seqs: Vec<u64> = replay.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![96, 97, 98, 99, 100]);
    }

    #[test]
    fn min_replay_overrides_age() {
        let log = EventLog::new(RetentionPolicy {
            max_events: 5,
            max_age: Duration::ZERO,
            min_replay: 100,
        });
        log.register("r");
        for _ in 0..50 {
            log.append("r", EventKind::Log, payload::log_line("n", "x"))
                .unwrap();
        }
        // Everything is stale by age and over the count window, but the
        // min_replay floor keeps all 50.
        assert_eq!(log.retention_floor("r").unwrap(), 1);
        assert_eq!(log.replay("r", 0, None).unwrap().events.len(), 50);
    }

    #[test]
    fn append_after_close_fails() {
        let log = EventLog::new(RetentionPolicy::default());
        log.register("r");
        log.append("r", EventKind::Status, payload::status(RunStatus::Canceled, None))
            .unwrap();
        log.close("r");
        assert!(matches!(
            log.append("r", EventKind::Log, payload::log_line("n", "x")),
            Err(EventLogError::Closed { .. })
        ));
        assert_eq!(log.current_status("r").unwrap(), RunStatus::Canceled);
    }

    #[test]
    fn unknown_run_is_an_error() {
        let log = EventLog::new(RetentionPolicy::default());
        assert!(matches!(
            log.append("ghost", EventKind::Log, Value::Null),
            Err(EventLogError::UnknownRun { .. })
        ));
    }
}
