#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use mentat_orchestrator::driver::DriverSet;
use mentat_orchestrator::event_log::{Event, EventLog, RetentionPolicy};
use mentat_orchestrator::manager::{ManagerConfig, RunManager};
use mentat_orchestrator::plan::Plan;
use mentat_orchestrator::scheduler::SchedulerConfig;
use mentat_orchestrator::store::MemoryRunStore;
use mentat_orchestrator::types::RunStatus;

/// Scheduler tuned for fast tests: tight backoff, short grace.
pub fn test_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_nodes: 4,
        max_retries: 3,
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(50),
        node_timeout: Duration::from_secs(30),
        cancel_grace: Duration::from_secs(5),
    }
}

/// Memory-backed engine with default retention.
pub fn test_engine() -> (Arc<RunManager>, Arc<EventLog>) {
    test_engine_with_retention(RetentionPolicy::default())
}

pub fn test_engine_with_retention(
    retention: RetentionPolicy,
) -> (Arc<RunManager>, Arc<EventLog>) {
    let events = EventLog::new(retention);
    let manager = RunManager::new(
        Arc::new(MemoryRunStore::new()),
        Arc::clone(&events),
        Arc::new(DriverSet::new()),
        ManagerConfig {
            max_concurrent_runs: 64,
            scheduler: test_scheduler_config(),
        },
    );
    (manager, events)
}

/// Plan where every node runs the simulated driver with the given params.
pub fn plan_with_params(nodes: &[(&str, Value)], edges: &[(&str, &str)]) -> Plan {
    let nodes: Vec<Value> = nodes
        .iter()
        .map(|(id, params)| json!({ "id": id, "params": params }))
        .collect();
    let edges: Vec<Value> = edges
        .iter()
        .map(|(from, to)| json!({ "from": from, "to": to }))
        .collect();
    serde_json::from_value(json!({ "nodes": nodes, "edges": edges })).expect("valid plan json")
}

/// Linear chain `a -> b -> c ...` of simulated nodes with one delay.
pub fn linear_plan(ids: &[&str], delay_ms: u64) -> Plan {
    let nodes: Vec<(&str, Value)> = ids
        .iter()
        .map(|id| (*id, json!({ "delay_ms": delay_ms })))
        .collect();
    let edges: Vec<(&str, &str)> = ids.windows(2).map(|pair| (pair[0], pair[1])).collect();
    plan_with_params(&nodes, &edges)
}

/// Diamond `a -> {b, c} -> d`.
pub fn diamond_plan(delay_ms: u64) -> Plan {
    let params = json!({ "delay_ms": delay_ms });
    plan_with_params(
        &[
            ("a", params.clone()),
            ("b", params.clone()),
            ("c", params.clone()),
            ("d", params),
        ],
        &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
    )
}

/// Subscribe from the beginning and drain the stream until the log
/// closes. Only usable once the run is guaranteed to reach terminal.
pub async fn drain_events(events: &EventLog, run_id: &str) -> Vec<Arc<Event>> {
    let mut cursor = events.subscribe(run_id, 0).expect("run registered");
    let mut collected = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), cursor.next()).await {
            Ok(Some(event)) => collected.push(event),
            Ok(None) => break,
            Err(_) => panic!("event stream did not terminate; got {collected:?}"),
        }
    }
    collected
}

/// Poll the store until the run reaches a terminal status.
pub async fn wait_terminal(manager: &RunManager, run_id: &str) -> RunStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let run = manager.get(run_id).await.expect("run exists");
        if run.status.is_terminal() {
            return run.status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {run_id} stuck in {}",
            run.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
