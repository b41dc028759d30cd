//! Control-plane contract tests driven through the router with
//! `tower::ServiceExt::oneshot`.

mod common;

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::*;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use mentat_orchestrator::api::{self, AppState};
use mentat_orchestrator::fanout::WsHub;

fn test_app() -> (Router, AppState) {
    let (manager, events) = test_engine();
    let state = AppState {
        manager,
        hub: WsHub::spawn(events),
        sse_heartbeat: Duration::from_secs(30),
    };
    (api::router(state.clone()), state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn create_then_fetch_run() {
    let (app, _) = test_app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/runs",
            json!({
                "plan": {
                    "nodes": [{"id": "a", "params": {"delay_ms": 1}}],
                    "edges": []
                },
                "metadata": {"owner": "tests"}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["status"], "queued");
    let id = created["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(get(&format!("/api/v1/runs/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response).await;
    assert_eq!(fetched["id"], id.as_str());
    assert_eq!(fetched["metadata"]["owner"], "tests");
    assert!(fetched["nodes"].is_array());

    let response = app.oneshot(get("/api/v1/runs")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listed = body_json(response).await;
    assert_eq!(listed["runs"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn cyclic_plan_is_rejected_with_validation_detail() {
    let (app, _) = test_app();
    let response = app
        .oneshot(post_json(
            "/api/v1/runs",
            json!({
                "plan": {
                    "nodes": [{"id": "a"}, {"id": "b"}],
                    "edges": [{"from": "a", "to": "b"}, {"from": "b", "to": "a"}]
                }
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "validation");
    assert_eq!(body["detail"], "cycle");
}

#[tokio::test]
async fn unknown_mode_is_a_validation_error() {
    let (app, _) = test_app();
    let response = app
        .oneshot(post_json(
            "/api/v1/runs",
            json!({
                "plan": { "nodes": [{"id": "a"}], "edges": [] },
                "mode": "podman"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "validation");
}

#[tokio::test]
async fn unknown_run_returns_404() {
    let (app, _) = test_app();
    for uri in [
        "/api/v1/runs/ghost",
        "/api/v1/runs/ghost/events",
    ] {
        let response = app.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
    }

    let response = app
        .oneshot(post_json("/api/v1/runs/ghost/cancel", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn start_and_cancel_lifecycle_codes() {
    let (app, state) = test_app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/runs",
            json!({
                "plan": {
                    "nodes": [{"id": "a", "params": {"delay_ms": 400}}],
                    "edges": []
                }
            }),
        ))
        .await
        .unwrap();
    let id = body_json(response).await["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post_json(&format!("/api/v1/runs/{id}/start"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // A second start on the now-running run is a 409.
    let response = app
        .clone()
        .oneshot(post_json(&format!("/api/v1/runs/{id}/start"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .clone()
        .oneshot(post_json(&format!("/api/v1/runs/{id}/cancel"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    wait_terminal(&state.manager, &id).await;

    // Cancel after cancel: still accepted.
    let response = app
        .oneshot(post_json(&format!("/api/v1/runs/{id}/cancel"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn checkpoints_append_to_the_stream() {
    let (app, state) = test_app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/runs",
            json!({
                "plan": { "nodes": [{"id": "a", "params": {"delay_ms": 1}}], "edges": [] }
            }),
        ))
        .await
        .unwrap();
    let id = body_json(response).await["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/api/v1/runs/{id}/checkpoints"),
            json!({ "label": "tool:call", "data": { "tool": "search" } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    let seq = body["seq"].as_u64().unwrap();
    assert!(seq >= 1);

    let replay = state.manager.events().replay(&id, 0, None).unwrap();
    let checkpoint = replay.events.iter().find(|e| e.seq == seq).unwrap();
    assert_eq!(checkpoint.payload["label"], "tool:call");

    // Unknown run: 404.
    let response = app
        .oneshot(post_json(
            "/api/v1/runs/ghost/checkpoints",
            json!({ "label": "x" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn purged_stream_is_gone_not_missing() {
    let (app, state) = test_app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/runs",
            json!({
                "plan": { "nodes": [{"id": "a", "params": {"delay_ms": 1}}], "edges": [] }
            }),
        ))
        .await
        .unwrap();
    let id = body_json(response).await["id"].as_str().unwrap().to_string();

    // Drop the log but keep the run record: subscribers get 410.
    state.manager.events().remove(&id);
    let response = app
        .oneshot(get(&format!("/api/v1/runs/{id}/events")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GONE);
}

#[tokio::test]
async fn health_endpoint_answers() {
    let (app, _) = test_app();
    let response = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
