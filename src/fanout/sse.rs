//! Server-Sent Events emitter.
//!
//! Frame contract, bit-exact: every event is
//!
//! ```text
//! id: <seq>
//! event: <kind>
//! data: <json>
//! ```
//!
//! The stream opens with a `hello` frame (`{run_id, server_time}`), then
//! replays from the resolved resume position, then follows the live tail
//! until the run's terminal event has been drained. A silent stretch
//! longer than the heartbeat interval produces an `event: heartbeat`
//! frame whose id repeats the last delivered seq.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::Event as SseEvent;
use futures_util::Stream;

use crate::event_log::{Event, EventLog, EventLogError, payload};
use crate::types::EventKind;

/// Resume position precedence: `Last-Event-ID` header, `lastEventId`
/// query, `replay=N` (last N events), retention floor.
pub fn resolve_start(
    events: &EventLog,
    run_id: &str,
    header_last_id: Option<u64>,
    query_last_id: Option<u64>,
    replay: Option<u64>,
) -> Result<u64, EventLogError> {
    if let Some(seq) = header_last_id {
        return Ok(seq);
    }
    if let Some(seq) = query_last_id {
        return Ok(seq);
    }
    if let Some(n) = replay {
        return Ok(events.last_seq(run_id)?.saturating_sub(n));
    }
    Ok(events.retention_floor(run_id)?.saturating_sub(1))
}

fn frame(event: &Event) -> SseEvent {
    SseEvent::default()
        .id(event.seq.to_string())
        .event(event.kind.as_str())
        .data(event.payload.to_string())
}

fn hello_frame(run_id: &str) -> SseEvent {
    SseEvent::default()
        .id("0")
        .event(EventKind::Hello.as_str())
        .data(
            serde_json::json!({
                "run_id": run_id,
                "server_time": chrono::Utc::now().to_rfc3339(),
            })
            .to_string(),
        )
}

fn heartbeat_frame(last_seq: u64) -> SseEvent {
    SseEvent::default()
        .id(last_seq.to_string())
        .event(EventKind::Heartbeat.as_str())
        .data(payload::heartbeat(chrono::Utc::now()).to_string())
}

/// Frame stream for one subscription. `after_seq` comes from
/// [`resolve_start`]; the cursor supplies gap sentinels when that
/// position predates the retention floor.
pub fn stream(
    events: Arc<EventLog>,
    run_id: String,
    after_seq: u64,
    heartbeat: Duration,
) -> Result<impl Stream<Item = Result<SseEvent, Infallible>>, EventLogError> {
    let mut cursor = events.subscribe(&run_id, after_seq)?;

    Ok(async_stream::stream! {
        yield Ok::<SseEvent, Infallible>(hello_frame(&run_id));
        let mut last_seq = after_seq;
        loop {
            match tokio::time::timeout(heartbeat, cursor.next()).await {
                Ok(Some(event)) => {
                    // The cursor's own hello is internal; SSE already sent
                    // its transport-level greeting.
                    if event.kind == EventKind::Hello {
                        continue;
                    }
                    last_seq = last_seq.max(event.seq);
                    yield Ok(frame(&event));
                }
                // Terminal event drained (or log dropped): stream ends.
                Ok(None) => break,
                Err(_) => yield Ok(heartbeat_frame(last_seq)),
            }
        }
    })
}
