//! Control plane facade: the HTTP/JSON boundary the outside world talks
//! to.
//!
//! Everything here is a thin mapping between the wire contract and
//! [`RunManager`](crate::manager::RunManager) / the fan-out layer; no
//! engine logic lives in handlers.
//!
//! | Method | Path | Purpose |
//! |---|---|---|
//! | POST | `/api/v1/runs` | create a run from a plan |
//! | GET | `/api/v1/runs` | list runs (501 when unsupported) |
//! | GET | `/api/v1/runs/{id}` | run snapshot incl. node states |
//! | DELETE | `/api/v1/runs/{id}` | soft-delete a finished run |
//! | POST | `/api/v1/runs/{id}/start` | begin execution |
//! | POST | `/api/v1/runs/{id}/cancel` | request cancellation |
//! | GET | `/api/v1/runs/{id}/events` | SSE stream with resume |
//! | POST | `/api/v1/runs/{id}/checkpoints` | append a checkpoint event |
//! | GET | `/ws` | WebSocket hub |
//! | GET | `/healthz` | liveness |

pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};

use crate::fanout::WsHub;
use crate::manager::RunManager;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<RunManager>,
    pub hub: Arc<WsHub>,
    pub sse_heartbeat: Duration,
}

/// Build the control-plane router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health))
        .route(
            "/api/v1/runs",
            post(handlers::create_run).get(handlers::list_runs),
        )
        .route(
            "/api/v1/runs/{id}",
            get(handlers::get_run).delete(handlers::delete_run),
        )
        .route("/api/v1/runs/{id}/start", post(handlers::start_run))
        .route("/api/v1/runs/{id}/cancel", post(handlers::cancel_run))
        .route("/api/v1/runs/{id}/events", get(handlers::stream_events))
        .route(
            "/api/v1/runs/{id}/checkpoints",
            post(handlers::append_checkpoint),
        )
        .route("/ws", get(handlers::ws_upgrade))
        .with_state(state)
}

// Re-exported so binaries can keep their imports short.
pub use handlers::ApiError;
