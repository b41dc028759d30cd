//! WebSocket hub: one task per process owning the connection set.
//!
//! Clients send `{op:"subscribe", run_id, filter?}` /
//! `{op:"unsubscribe", run_id}` and receive `{ok:...}` acks plus a stream
//! of `{run_id, event}` frames for their topics. All mutation of the
//! connection set happens inside the hub task via its command channel;
//! per-topic forwarder tasks read event-log cursors and push into the
//! connection's outbound queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::SubscriptionFilter;
use crate::event_log::EventLog;

/// Outbound queue depth per connection; a client that cannot drain this
/// many frames gets disconnected rather than stalling the hub.
const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientOp {
    Subscribe {
        run_id: String,
        #[serde(default)]
        filter: SubscriptionFilter,
    },
    Unsubscribe {
        run_id: String,
    },
}

enum HubCommand {
    Register {
        conn_id: u64,
        out: mpsc::Sender<String>,
    },
    Deregister {
        conn_id: u64,
    },
    Subscribe {
        conn_id: u64,
        run_id: String,
        filter: SubscriptionFilter,
        resp: oneshot::Sender<Result<(), String>>,
    },
    Unsubscribe {
        conn_id: u64,
        run_id: String,
        resp: oneshot::Sender<Result<(), String>>,
    },
}

struct Connection {
    out: mpsc::Sender<String>,
    topics: FxHashMap<String, JoinHandle<()>>,
}

/// Handle to the process-wide hub task.
pub struct WsHub {
    commands: mpsc::Sender<HubCommand>,
    next_conn_id: AtomicU64,
}

impl WsHub {
    /// Start the hub task and return its handle.
    #[must_use]
    pub fn spawn(events: Arc<EventLog>) -> Arc<Self> {
        let (commands, inbox) = mpsc::channel(64);
        tokio::spawn(hub_task(events, inbox, commands.clone()));
        Arc::new(Self {
            commands,
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// Drive one accepted WebSocket connection to completion.
    pub async fn handle_socket(&self, socket: WebSocket) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        if self
            .commands
            .send(HubCommand::Register {
                conn_id,
                out: out_tx,
            })
            .await
            .is_err()
        {
            return;
        }

        let (mut ws_tx, mut ws_rx) = socket.split();
        loop {
            tokio::select! {
                outbound = out_rx.recv() => {
                    let Some(json) = outbound else { break };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                inbound = ws_rx.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            let reply = self.handle_op(conn_id, text.as_str()).await;
                            if ws_tx.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::debug!(conn_id, error = %err, "websocket receive error");
                            break;
                        }
                    }
                }
            }
        }

        let _ = self
            .commands
            .send(HubCommand::Deregister { conn_id })
            .await;
    }

    async fn handle_op(&self, conn_id: u64, raw: &str) -> String {
        let op = match serde_json::from_str::<ClientOp>(raw) {
            Ok(op) => op,
            Err(err) => {
                return serde_json::json!({ "ok": false, "error": format!("bad op: {err}") })
                    .to_string();
            }
        };

        let (resp_tx, resp_rx) = oneshot::channel();
        let command = match op {
            ClientOp::Subscribe { run_id, filter } => HubCommand::Subscribe {
                conn_id,
                run_id,
                filter,
                resp: resp_tx,
            },
            ClientOp::Unsubscribe { run_id } => HubCommand::Unsubscribe {
                conn_id,
                run_id,
                resp: resp_tx,
            },
        };
        if self.commands.send(command).await.is_err() {
            return serde_json::json!({ "ok": false, "error": "hub unavailable" }).to_string();
        }
        match resp_rx.await {
            Ok(Ok(())) => serde_json::json!({ "ok": true }).to_string(),
            Ok(Err(error)) => serde_json::json!({ "ok": false, "error": error }).to_string(),
            Err(_) => serde_json::json!({ "ok": false, "error": "hub unavailable" }).to_string(),
        }
    }
}

async fn hub_task(
    events: Arc<EventLog>,
    mut inbox: mpsc::Receiver<HubCommand>,
    commands: mpsc::Sender<HubCommand>,
) {
    let mut connections: FxHashMap<u64, Connection> = FxHashMap::default();

    while let Some(command) = inbox.recv().await {
        match command {
            HubCommand::Register { conn_id, out } => {
                connections.insert(
                    conn_id,
                    Connection {
                        out,
                        topics: FxHashMap::default(),
                    },
                );
            }
            HubCommand::Deregister { conn_id } => {
                if let Some(connection) = connections.remove(&conn_id) {
                    for (_, forwarder) in connection.topics {
                        forwarder.abort();
                    }
                }
            }
            HubCommand::Subscribe {
                conn_id,
                run_id,
                filter,
                resp,
            } => {
                let result =
                    subscribe(&events, &commands, &mut connections, conn_id, run_id, filter);
                let _ = resp.send(result);
            }
            HubCommand::Unsubscribe {
                conn_id,
                run_id,
                resp,
            } => {
                let result = match connections.get_mut(&conn_id) {
                    Some(connection) => match connection.topics.remove(&run_id) {
                        Some(forwarder) => {
                            forwarder.abort();
                            Ok(())
                        }
                        None => Err(format!("not subscribed to {run_id}")),
                    },
                    None => Err("unknown connection".to_string()),
                };
                let _ = resp.send(result);
            }
        }
    }
}

fn subscribe(
    events: &Arc<EventLog>,
    commands: &mpsc::Sender<HubCommand>,
    connections: &mut FxHashMap<u64, Connection>,
    conn_id: u64,
    run_id: String,
    filter: SubscriptionFilter,
) -> Result<(), String> {
    let Some(connection) = connections.get_mut(&conn_id) else {
        return Err("unknown connection".to_string());
    };
    if connection.topics.contains_key(&run_id) {
        // Re-subscribing replaces the filter by restarting the forwarder.
        if let Some(previous) = connection.topics.remove(&run_id) {
            previous.abort();
        }
    }

    // Hub subscriptions are live-tail: history is the SSE endpoint's job.
    let tail_from = events
        .last_seq(&run_id)
        .map_err(|err| err.to_string())?;
    let mut cursor = events
        .subscribe(&run_id, tail_from)
        .map_err(|err| err.to_string())?;

    let out = connection.out.clone();
    let commands = commands.clone();
    let topic = run_id.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = cursor.next().await {
            if !filter.accepts(&event) {
                continue;
            }
            let frame = serde_json::json!({ "run_id": topic, "event": &*event }).to_string();
            match out.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow consumer: drop the whole connection instead of
                    // parking the forwarder behind its queue.
                    tracing::warn!(
                        conn_id,
                        run_id = %topic,
                        "websocket client cannot keep up; disconnecting"
                    );
                    let _ = commands.try_send(HubCommand::Deregister { conn_id });
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    });
    connection.topics.insert(run_id, forwarder);
    Ok(())
}
