//! The `EventLog` trait and cursor helpers.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use colloquy_types::error::EventLogError;
use colloquy_types::event::{NewStreamEvent, StreamEvent};

/// Parse a replay cursor.
///
/// The wire carries the cursor as a string (`lastEventId`). An absent,
/// `"0"`, or unparseable cursor means "from the beginning". Timestamps are
/// compared numerically, never lexicographically: a client that reconnects
/// with `lastEventId=1000` must not be replayed events at timestamp 150 even
/// though `"150" > "1000"` as strings.
pub fn parse_cursor(last_event_id: &str) -> i64 {
    last_event_id.trim().parse::<i64>().unwrap_or(0)
}

/// Filter a chronologically ordered slice down to events strictly newer than
/// the cursor.
pub fn replay_after_cursor(events: &[StreamEvent], last_event_id: &str) -> Vec<StreamEvent> {
    let cursor = parse_cursor(last_event_id);
    events
        .iter()
        .filter(|event| event.timestamp > cursor)
        .cloned()
        .collect()
}

/// Append-only, per-key ordered log of stream events.
///
/// Keys are session ids or operation ids. `append` assigns the event's
/// timestamp from the per-key monotonic clock; `history` returns the most
/// recent events newest-first; `subscribe` delivers batches of events in
/// generation order starting strictly after the cursor, with no duplicates
/// and no gaps, until the token is cancelled or the receiver is dropped.
///
/// Implementations: `InMemoryEventLog` (single process),
/// `colloquy_infra::sqlite::SqliteEventLog` (durable, cross-process
/// fan-out). Uses native async fn in traits (RPITIT, Rust 2024 edition).
pub trait EventLog: Send + Sync + 'static {
    /// Append an event, assigning its timestamp. Returns the stored event.
    fn append(
        &self,
        key: &str,
        event: NewStreamEvent,
    ) -> impl std::future::Future<Output = Result<StreamEvent, EventLogError>> + Send;

    /// Up to `limit` most recent events for `key`, sorted newest-first.
    fn history(
        &self,
        key: &str,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<StreamEvent>, EventLogError>> + Send;

    /// Subscribe to events for `key` from a cursor. Each received batch is in
    /// generation order; batches never overlap or skip events.
    fn subscribe(
        &self,
        key: &str,
        last_event_id: &str,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<mpsc::Receiver<Vec<StreamEvent>>, EventLogError>> + Send;
}
