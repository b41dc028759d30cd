//! Per-run ordered event logs with tail subscription and bounded replay.
//!
//! Every run owns an append-only sequence of [`Event`]s with gap-free,
//! monotonically increasing `seq` numbers. The log is a bounded ring:
//! events older than the retention window are evicted, and replays that
//! reach below the retention floor are answered honestly with a `gap`
//! sentinel instead of silently missing data.
//!
//! The module is organised around a process-wide [`EventLog`] registry and
//! per-run tail broadcasts consumed through [`EventCursor`].

pub mod cursor;
pub mod event;
pub mod log;

pub use cursor::EventCursor;
pub use event::{
    CHECKPOINT_EDGE_TRANSMIT, CHECKPOINT_NODE_EXEC, CHECKPOINT_TOOL_CALL, Event, payload,
};
pub use log::{EventLog, EventLogError, Gap, Replay, RetentionPolicy};
