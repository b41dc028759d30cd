use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;

use super::event::Event;
use super::log::{Gap, RunLog};

/// Ordered reader over one run's event stream.
///
/// A cursor yields, in order: an optional synthetic `hello`, an optional
/// `gap` sentinel (when the requested start predates retention), the
/// buffered backlog, then the live tail. It never yields the same seq
/// twice and never goes backwards. The cursor is finite iff the run's log
/// has been closed and the tail is drained; dropping it cancels the
/// subscription.
pub struct EventCursor {
    log: Arc<RunLog>,
    hello: Option<Event>,
    gap: Option<Gap>,
    backlog: VecDeque<Arc<Event>>,
    tail: Option<broadcast::Receiver<Arc<Event>>>,
    last_seq: u64,
    run_id: String,
}

impl EventCursor {
    pub(crate) fn new(
        log: Arc<RunLog>,
        replay: super::log::Replay,
        tail: Option<broadcast::Receiver<Arc<Event>>>,
        after_seq: u64,
    ) -> Self {
        let run_id = log.run_id().to_string();
        Self {
            log,
            hello: None,
            gap: replay.gap,
            backlog: replay.events.into(),
            tail,
            last_seq: after_seq,
            run_id,
        }
    }

    pub(crate) fn prepend_hello(&mut self, hello: Event) {
        self.hello = Some(hello);
    }

    /// Seq of the last real event delivered.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.last_seq
    }

    /// Next event, or `None` once the log is closed and drained.
    pub async fn next(&mut self) -> Option<Arc<Event>> {
        loop {
            if let Some(hello) = self.hello.take() {
                return Some(Arc::new(hello));
            }
            // A refill may (re)discover a gap; it always outranks the
            // backlog it arrived with.
            if let Some(gap) = self.gap.take() {
                self.last_seq = self.last_seq.max(gap.to);
                return Some(Arc::new(gap.to_event(&self.run_id)));
            }

            if let Some(event) = self.backlog.pop_front() {
                if event.seq <= self.last_seq {
                    continue;
                }
                self.last_seq = event.seq;
                return Some(event);
            }

            let Some(tail) = self.tail.as_mut() else {
                return None;
            };
            match tail.recv().await {
                Ok(event) => {
                    if event.seq <= self.last_seq {
                        continue;
                    }
                    self.last_seq = event.seq;
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Fell off the broadcast buffer; recover from the ring.
                    self.log.record_lag(missed);
                    self.refill();
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // Log closed; pick up anything appended before the
                    // close that the broadcast did not deliver, then end.
                    self.tail = None;
                    self.refill();
                }
            }
        }
    }

    fn refill(&mut self) {
        let replay = self.log.replay(self.last_seq, None);
        if let Some(gap) = replay.gap {
            self.gap = Some(gap);
        }
        self.backlog = replay.events.into();
    }

    /// Adapt the cursor into a boxed stream for use with SSE/WebSocket
    /// combinators without exposing pinning at call sites.
    pub fn into_stream(self) -> BoxStream<'static, Arc<Event>> {
        stream::unfold(self, |mut cursor| async move {
            cursor.next().await.map(|event| (event, cursor))
        })
        .boxed()
    }
}
