//! # Mentat Orchestrator: DAG run engine with ordered event fan-out
//!
//! The engine accepts a plan (nodes + edges), schedules nodes respecting
//! their dependencies, executes them through pluggable drivers, persists
//! recoverable run state, and publishes a totally ordered event stream
//! per run that external clients consume over SSE or the WebSocket hub.
//!
//! ## Core pieces
//!
//! - **Plan** ([`plan`]) — opaque-JSON plans validated once into a
//!   [`CompiledPlan`](plan::CompiledPlan) (unique ids, declared
//!   endpoints, acyclic).
//! - **EventLog** ([`event_log`]) — per-run append-only ring with
//!   gap-free `seq`, bounded retention, tail cursors, and honest gap
//!   sentinels for replays below the retention floor.
//! - **RunStore** ([`store`]) — Memory/Redis/K8s persistence behind one
//!   interface with CAS status transitions.
//! - **Driver** ([`driver`]) — Simulated, Subprocess, Redis-queue, and
//!   K8s-Job executors for single node attempts.
//! - **Scheduler** ([`scheduler`]) — the per-run DAG state machine:
//!   ready-set dispatch, retries with backoff, cancellation with bounded
//!   grace.
//! - **RunManager** ([`manager`]) — process-wide registry, lifecycle, and
//!   back-pressure.
//! - **Fanout** ([`fanout`]) — SSE emitter with `Last-Event-ID` resume
//!   and the WebSocket hub with topic filters.
//! - **Control plane** ([`api`]) — the axum router exposing run CRUD,
//!   lifecycle, and event subscription.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use mentat_orchestrator::driver::DriverSet;
//! use mentat_orchestrator::event_log::{EventLog, RetentionPolicy};
//! use mentat_orchestrator::manager::{CreateOptions, ManagerConfig, RunManager};
//! use mentat_orchestrator::plan::Plan;
//! use mentat_orchestrator::store::MemoryRunStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let events = EventLog::new(RetentionPolicy::default());
//! let manager = RunManager::new(
//!     Arc::new(MemoryRunStore::new()),
//!     Arc::clone(&events),
//!     Arc::new(DriverSet::new()),
//!     ManagerConfig::default(),
//! );
//!
//! let plan: Plan = serde_json::from_value(serde_json::json!({
//!     "nodes": [{"id": "a"}, {"id": "b"}],
//!     "edges": [{"from": "a", "to": "b"}],
//! }))?;
//!
//! let run = manager.create(plan, CreateOptions::default()).await?;
//! manager.start(&run.id).await?;
//!
//! let mut cursor = events.subscribe(&run.id, 0)?;
//! while let Some(event) = cursor.next().await {
//!     println!("{} {}: {}", event.seq, event.kind, event.payload);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Ordering guarantees
//!
//! Within one run and one subscription, events arrive in strictly
//! increasing `seq` with no gaps other than explicit `gap` sentinels
//! after retention trimming. Exactly one terminal `status` event exists
//! per run and nothing follows it. Every observable state transition has
//! its event appended before the store write becomes visible.

pub mod api;
pub mod config;
pub mod driver;
pub mod event_log;
pub mod fanout;
pub mod manager;
pub mod plan;
pub mod scheduler;
pub mod store;
pub mod types;
