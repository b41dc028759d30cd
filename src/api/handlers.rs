use axum::Json;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};

use super::AppState;
use crate::event_log::{EventLogError, payload};
use crate::fanout::sse;
use crate::manager::{CreateOptions, ManagerError};
use crate::plan::Plan;
use crate::store::StoreError;
use crate::types::{ErrorKind, EventKind, RunMode};

/// Wire-shaped error: status code plus `{error, detail}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: ErrorKind,
    detail: String,
}

impl ApiError {
    #[must_use]
    pub fn new(status: StatusCode, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            detail: detail.into(),
        }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorKind::NotFound, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.kind,
            "detail": self.detail,
        }));
        (self.status, body).into_response()
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        let status = match &err {
            ManagerError::Validation(_) => StatusCode::BAD_REQUEST,
            ManagerError::AlreadyTerminal { .. } | ManagerError::RunActive { .. } => {
                StatusCode::CONFLICT
            }
            ManagerError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ManagerError::Store(StoreError::NotImplemented) => StatusCode::NOT_IMPLEMENTED,
            ManagerError::Store(StoreError::Backend(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ManagerError::Store(_) => StatusCode::CONFLICT,
        };
        // Validation details keep the terse machine-readable form
        // ("cycle", "duplicate node id: x") rather than the full chain.
        let detail = match &err {
            ManagerError::Validation(inner) => inner.to_string(),
            other => other.to_string(),
        };
        Self::new(status, err.kind(), detail)
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub plan: Plan,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

pub async fn create_run(
    State(state): State<AppState>,
    Json(request): Json<CreateRunRequest>,
) -> Result<Response, ApiError> {
    // Unknown modes are a validation error, same as a malformed plan.
    let mode = request
        .mode
        .as_deref()
        .map(str::parse::<RunMode>)
        .transpose()
        .map_err(|err| {
            ApiError::new(StatusCode::BAD_REQUEST, ErrorKind::Validation, err.to_string())
        })?;

    let run = state
        .manager
        .create(
            request.plan,
            CreateOptions {
                id: request.id,
                mode,
                metadata: request.metadata.unwrap_or(Value::Null),
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(run)).into_response())
}

pub async fn list_runs(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let runs = state.manager.list().await?;
    Ok(Json(json!({ "runs": runs })))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = state.manager.get(&id).await?;
    let nodes = state.manager.node_states(&id).await.unwrap_or_default();
    let mut body = serde_json::to_value(&run)
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Internal, err.to_string()))?;
    body["nodes"] = serde_json::to_value(nodes)
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Internal, err.to_string()))?;
    Ok(Json(body))
}

pub async fn delete_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let (run, started) = state.manager.start(&id).await?;
    if started {
        Ok((StatusCode::ACCEPTED, Json(run)).into_response())
    } else {
        Err(ApiError::new(
            StatusCode::CONFLICT,
            ErrorKind::Conflict,
            format!("run {id} is {}, not queued", run.status),
        ))
    }
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let run = state.manager.cancel(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(run)).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    #[serde(rename = "lastEventId")]
    pub last_event_id: Option<u64>,
    pub replay: Option<u64>,
}

fn header_last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().parse().ok())
}

pub async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let events = state.manager.events();

    if !events.contains(&id) {
        // Distinguish "never existed" from "existed, stream purged".
        return match state.manager.get(&id).await {
            Ok(_) => Err(ApiError::new(
                StatusCode::GONE,
                ErrorKind::NotFound,
                format!("event stream for run {id} is beyond retention"),
            )),
            Err(err) => Err(err.into()),
        };
    }

    let after_seq = sse::resolve_start(
        events,
        &id,
        header_last_event_id(&headers),
        query.last_event_id,
        query.replay,
    )
    .map_err(|err| match err {
        EventLogError::UnknownRun { .. } => ApiError::not_found(err.to_string()),
        other => ApiError::new(StatusCode::GONE, ErrorKind::NotFound, other.to_string()),
    })?;

    let stream = sse::stream(
        std::sync::Arc::clone(events),
        id,
        after_seq,
        state.sse_heartbeat,
    )
    .map_err(|err| ApiError::not_found(err.to_string()))?;

    Ok(Sse::new(stream).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CheckpointRequest {
    pub label: String,
    #[serde(default)]
    pub data: Option<Value>,
}

pub async fn append_checkpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CheckpointRequest>,
) -> Result<Response, ApiError> {
    // 404 for unknown runs even when the log is already gone.
    state.manager.get(&id).await?;

    let seq = state
        .manager
        .events()
        .append(
            &id,
            EventKind::Checkpoint,
            payload::checkpoint(&request.label, request.data.unwrap_or(Value::Null)),
        )
        .map_err(|err| match err {
            EventLogError::Closed { .. } => ApiError::new(
                StatusCode::CONFLICT,
                ErrorKind::Conflict,
                "run already reached a terminal status",
            ),
            other => ApiError::not_found(other.to_string()),
        })?;
    Ok((StatusCode::CREATED, Json(json!({ "seq": seq }))).into_response())
}

pub async fn ws_upgrade(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    let hub = std::sync::Arc::clone(&state.hub);
    upgrade.on_upgrade(move |socket| async move { hub.handle_socket(socket).await })
}
