//! WebSocket hub: subscribe acks, topic wrapping, filters, unsubscribe.

mod common;

use std::time::Duration;

use common::*;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use mentat_orchestrator::api::{self, AppState};
use mentat_orchestrator::fanout::WsHub;
use mentat_orchestrator::manager::CreateOptions;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn serve() -> (String, AppState) {
    let (manager, events) = test_engine();
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
    (format!("ws://{addr}/ws"), state)
}

async fn recv_json(socket: &mut WsStream) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("socket produced a frame")
            .expect("socket open")
            .expect("no transport error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn subscribe_ack_then_wrapped_events() {
    let (url, state) = serve().await;
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();

    let run = state
        .manager
        .create(linear_plan(&["a"], 50), CreateOptions::default())
        .await
        .unwrap();

    socket
        .send(Message::Text(
            json!({ "op": "subscribe", "run_id": run.id }).to_string(),
        ))
        .await
        .unwrap();
    let ack = recv_json(&mut socket).await;
    assert_eq!(ack, json!({ "ok": true }));

    state.manager.start(&run.id).await.unwrap();

    // Collect frames until the terminal status arrives.
    let mut saw_running = false;
    loop {
        let frame = recv_json(&mut socket).await;
        assert_eq!(frame["run_id"], run.id.as_str());
        let event = &frame["event"];
        assert!(event["seq"].as_u64().is_some());
        if event["kind"] == "node_status" && event["payload"]["status"] == "running" {
            saw_running = true;
        }
        if event["kind"] == "status" && event["payload"]["status"] == "succeeded" {
            break;
        }
    }
    assert!(saw_running);
}

#[tokio::test]
async fn filters_drop_unwanted_kinds_but_keep_status() {
    let (url, state) = serve().await;
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();

    let run = state
        .manager
        .create(linear_plan(&["a", "b"], 20), CreateOptions::default())
        .await
        .unwrap();

    socket
        .send(Message::Text(
            json!({
                "op": "subscribe",
                "run_id": run.id,
                "filter": { "kinds": ["status", "node_status"], "node_ids": ["b"] }
            })
            .to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(recv_json(&mut socket).await["ok"], true);

    state.manager.start(&run.id).await.unwrap();

    let mut kinds = Vec::new();
    loop {
        let frame = recv_json(&mut socket).await;
        let event = &frame["event"];
        let kind = event["kind"].as_str().unwrap().to_string();
        if let Some(node) = event["payload"]["node_id"].as_str() {
            assert_eq!(node, "b", "node filter leaked {event}");
        }
        kinds.push(kind.clone());
        if kind == "status" && event["payload"]["status"] == "succeeded" {
            break;
        }
    }
    assert!(kinds.iter().all(|k| k == "status" || k == "node_status"));
    assert!(kinds.contains(&"node_status".to_string()));
}

#[tokio::test]
async fn unsubscribe_stops_the_feed_and_unknown_runs_error() {
    let (url, state) = serve().await;
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();

    // Unknown run: explicit error ack.
    socket
        .send(Message::Text(
            json!({ "op": "subscribe", "run_id": "ghost" }).to_string(),
        ))
        .await
        .unwrap();
    let ack = recv_json(&mut socket).await;
    assert_eq!(ack["ok"], false);

    let run = state
        .manager
        .create(linear_plan(&["a"], 100), CreateOptions::default())
        .await
        .unwrap();
    socket
        .send(Message::Text(
            json!({ "op": "subscribe", "run_id": run.id }).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(recv_json(&mut socket).await["ok"], true);

    socket
        .send(Message::Text(
            json!({ "op": "unsubscribe", "run_id": run.id }).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(recv_json(&mut socket).await["ok"], true);

    // Events flowing after unsubscribe must not reach this connection.
    state.manager.start(&run.id).await.unwrap();
    wait_terminal(&state.manager, &run.id).await;
    let silent = tokio::time::timeout(Duration::from_millis(200), socket.next()).await;
    assert!(silent.is_err(), "received a frame after unsubscribe");
}
