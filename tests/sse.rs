//! SSE wire-format, resume, and retention-gap behavior against a real
//! listener.

mod common;

use std::time::Duration;

use common::*;
use futures_util::StreamExt;
use serde_json::Value;

use mentat_orchestrator::api::{self, AppState};
use mentat_orchestrator::event_log::{RetentionPolicy, payload};
use mentat_orchestrator::fanout::WsHub;
use mentat_orchestrator::manager::CreateOptions;
use mentat_orchestrator::types::{EventKind, RunStatus};

struct SseFrame {
    id: Option<String>,
    event: Option<String>,
    data: Option<String>,
}

/// Minimal SSE parser for complete (double-newline terminated) frames.
fn parse_frames(raw: &str) -> Vec<SseFrame> {
    raw.split("\n\n")
        .filter(|chunk| !chunk.trim().is_empty())
        .map(|chunk| {
            let mut frame = SseFrame {
                id: None,
                event: None,
                data: None,
            };
            for line in chunk.lines() {
                if let Some(rest) = line.strip_prefix("id: ") {
                    frame.id = Some(rest.to_string());
                } else if let Some(rest) = line.strip_prefix("event: ") {
                    frame.event = Some(rest.to_string());
                } else if let Some(rest) = line.strip_prefix("data: ") {
                    frame.data = Some(rest.to_string());
                }
            }
            frame
        })
        .collect()
}

async fn serve(retention: RetentionPolicy) -> (String, AppState) {
    let (manager, events) = test_engine_with_retention(retention);
    let state = AppState {
        manager,
        hub: WsHub::spawn(events),
        sse_heartbeat: Duration::from_secs(30),
    };
    let router = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (format!("http://{addr}"), state)
}

/// Read the full SSE body of a finished run.
async fn fetch_stream(url: &str, last_event_id: Option<u64>) -> Vec<SseFrame> {
    let client = reqwest::Client::new();
    let mut request = client.get(url);
    if let Some(id) = last_event_id {
        request = request.header("Last-Event-ID", id.to_string());
    }
    let response = request.send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let mut body = response.bytes_stream();
    let mut raw = String::new();
    while let Ok(Some(chunk)) =
        tokio::time::timeout(Duration::from_secs(5), body.next()).await
    {
        raw.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
    }
    parse_frames(&raw)
}

#[tokio::test]
async fn frames_carry_id_event_and_json_data() {
    let (base, state) = serve(RetentionPolicy::default()).await;
    let run = state
        .manager
        .create(linear_plan(&["a", "b"], 5), CreateOptions::default())
        .await
        .unwrap();
    state.manager.start(&run.id).await.unwrap();
    wait_terminal(&state.manager, &run.id).await;

    let frames = fetch_stream(&format!("{base}/api/v1/runs/{}/events", run.id), None).await;

    assert_eq!(frames[0].event.as_deref(), Some("hello"));
    let hello: Value = serde_json::from_str(frames[0].data.as_deref().unwrap()).unwrap();
    assert_eq!(hello["run_id"], run.id.as_str());
    assert!(hello["server_time"].is_string());

    // Every subsequent frame: id = seq, event = kind, data = JSON.
    let mut last_seq = 0u64;
    for frame in &frames[1..] {
        let seq: u64 = frame.id.as_deref().unwrap().parse().unwrap();
        assert!(seq > last_seq, "ids must increase strictly");
        last_seq = seq;
        assert!(frame.event.is_some());
        let data: Value = serde_json::from_str(frame.data.as_deref().unwrap()).unwrap();
        assert!(data.is_object());
    }

    let terminal = frames.last().unwrap();
    assert_eq!(terminal.event.as_deref(), Some("status"));
    let data: Value = serde_json::from_str(terminal.data.as_deref().unwrap()).unwrap();
    assert_eq!(data["status"], "succeeded");
}

#[tokio::test]
async fn resume_from_last_event_id_delivers_exact_suffix() {
    let (base, state) = serve(RetentionPolicy::default()).await;
    let run = state
        .manager
        .create(linear_plan(&["a"], 2), CreateOptions::default())
        .await
        .unwrap();

    // 20 checkpoint events before the run even starts.
    for i in 0..20 {
        state
            .manager
            .events()
            .append(
                &run.id,
                EventKind::Checkpoint,
                payload::checkpoint("tool:call", serde_json::json!({ "i": i })),
            )
            .unwrap();
    }
    state.manager.start(&run.id).await.unwrap();
    wait_terminal(&state.manager, &run.id).await;

    let frames = fetch_stream(
        &format!("{base}/api/v1/runs/{}/events", run.id),
        Some(10),
    )
    .await;

    // hello, then 11, 12, ... with no duplicates and no gaps.
    assert_eq!(frames[0].event.as_deref(), Some("hello"));
    let seqs: Vec<u64> = frames[1..]
        .iter()
        .map(|f| f.id.as_deref().unwrap().parse().unwrap())
        .collect();
    assert_eq!(seqs[0], 11);
    for pair in seqs.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }
}

#[tokio::test]
async fn resume_below_retention_floor_gets_gap_sentinel() {
    let retention = RetentionPolicy {
        max_events: 5,
        max_age: Duration::ZERO,
        min_replay: 5,
    };
    let (base, state) = serve(retention).await;
    let run = state
        .manager
        .create(linear_plan(&["a"], 2), CreateOptions::default())
        .await
        .unwrap();

    for i in 0..100 {
        state
            .manager
            .events()
            .append(
                &run.id,
                EventKind::Checkpoint,
                payload::checkpoint("tool:call", serde_json::json!({ "i": i })),
            )
            .unwrap();
    }
    // Seal the stream so the fetch terminates.
    state
        .manager
        .events()
        .append(
            &run.id,
            EventKind::Status,
            payload::status(RunStatus::Canceled, None),
        )
        .unwrap();
    state.manager.events().close(&run.id);

    let frames = fetch_stream(
        &format!("{base}/api/v1/runs/{}/events", run.id),
        Some(1),
    )
    .await;

    assert_eq!(frames[0].event.as_deref(), Some("hello"));
    assert_eq!(frames[1].event.as_deref(), Some("gap"));
    let gap: Value = serde_json::from_str(frames[1].data.as_deref().unwrap()).unwrap();
    assert_eq!(gap["from"], 2);
    assert_eq!(gap["to"], 96);

    let first_real: u64 = frames[2].id.as_deref().unwrap().parse().unwrap();
    assert_eq!(first_real, 97);
}

#[tokio::test]
async fn heartbeat_frames_appear_on_quiet_streams() {
    let (manager, events) = test_engine();
    let state = AppState {
        manager,
        hub: WsHub::spawn(events),
        sse_heartbeat: Duration::from_millis(100),
    };
    let router = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    // Created but never started: the stream stays silent.
    let run = state
        .manager
        .create(linear_plan(&["a"], 1), CreateOptions::default())
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/api/v1/runs/{}/events", run.id))
        .send()
        .await
        .unwrap();
    let mut body = response.bytes_stream();
    let mut raw = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(200), body.next()).await {
            Ok(Some(chunk)) => raw.push_str(&String::from_utf8_lossy(&chunk.unwrap())),
            _ => {}
        }
        if raw.matches("event: heartbeat").count() >= 2 {
            break;
        }
    }

    let frames = parse_frames(&raw);
    let heartbeats: Vec<&SseFrame> = frames
        .iter()
        .filter(|f| f.event.as_deref() == Some("heartbeat"))
        .collect();
    assert!(heartbeats.len() >= 2, "expected repeated heartbeats");
    let data: Value = serde_json::from_str(heartbeats[0].data.as_deref().unwrap()).unwrap();
    assert!(data["ts"].is_string());
}
