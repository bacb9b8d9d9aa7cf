//! Durable event log over SQLite.
//!
//! Implements `colloquy_core::event::EventLog` against the split-pool
//! database so history and subscriptions survive restarts and work across
//! processes sharing the same file. Live delivery inside one process rides
//! an in-memory notify channel; a polling fallback picks up rows written by
//! other processes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::Row;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use colloquy_core::event::{EventLog, SessionClock, parse_cursor};
use colloquy_types::error::EventLogError;
use colloquy_types::event::{NewStreamEvent, StreamEvent};

use super::pool::DatabasePool;

const NOTIFY_CAPACITY: usize = 1024;
const SUBSCRIBE_BUFFER: usize = 64;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn storage(e: sqlx::Error) -> EventLogError {
    EventLogError::Storage(e.to_string())
}

/// SQLite-backed event log with notify-assisted live subscriptions.
#[derive(Clone)]
pub struct SqliteEventLog {
    pool: DatabasePool,
    clock: Arc<SessionClock>,
    notify: broadcast::Sender<(String, StreamEvent)>,
    primed: Arc<Mutex<HashSet<String>>>,
    poll_interval: Duration,
}

impl SqliteEventLog {
    pub fn new(pool: DatabasePool) -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            pool,
            clock: Arc::new(SessionClock::new()),
            notify,
            primed: Arc::new(Mutex::new(HashSet::new())),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the cross-process polling interval (tests use a short one).
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Fast-forward the per-key clock past any timestamps already persisted,
    /// so a restarted process keeps the monotonic invariant.
    async fn prime_clock(&self, key: &str) -> Result<(), EventLogError> {
        if self.primed.lock().unwrap().contains(key) {
            return Ok(());
        }

        let row = sqlx::query(
            "SELECT COALESCE(MAX(timestamp), 0) AS max_ts FROM stream_events WHERE stream_key = ?",
        )
        .bind(key)
        .fetch_one(&self.pool.reader)
        .await
        .map_err(storage)?;
        let max_ts: i64 = row.get("max_ts");

        self.clock.observe(key, max_ts);
        self.primed.lock().unwrap().insert(key.to_string());
        Ok(())
    }

    async fn events_after(&self, key: &str, cursor: i64) -> Result<Vec<StreamEvent>, EventLogError> {
        let rows = sqlx::query(
            "SELECT payload FROM stream_events
             WHERE stream_key = ? AND timestamp > ?
             ORDER BY timestamp ASC",
        )
        .bind(key)
        .bind(cursor)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(storage)?;

        rows.into_iter()
            .map(|row| {
                let payload: String = row.get("payload");
                serde_json::from_str(&payload)
                    .map_err(|e| EventLogError::Serialization(e.to_string()))
            })
            .collect()
    }
}

impl EventLog for SqliteEventLog {
    async fn append(&self, key: &str, event: NewStreamEvent) -> Result<StreamEvent, EventLogError> {
        self.prime_clock(key).await?;

        let stored = StreamEvent {
            payload: event.payload,
            timestamp: self.clock.next(key),
            operation_id: event.operation_id,
            step_index: event.step_index,
        };
        let payload = serde_json::to_string(&stored)
            .map_err(|e| EventLogError::Serialization(e.to_string()))?;

        sqlx::query(
            "INSERT INTO stream_events (stream_key, operation_id, event_type, step_index, timestamp, payload)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(key)
        .bind(&stored.operation_id)
        .bind(stored.event_type())
        .bind(stored.step_index.map(|s| s as i64))
        .bind(stored.timestamp)
        .bind(&payload)
        .execute(&self.pool.writer)
        .await
        .map_err(storage)?;

        let _ = self.notify.send((key.to_string(), stored.clone()));
        Ok(stored)
    }

    async fn history(&self, key: &str, limit: usize) -> Result<Vec<StreamEvent>, EventLogError> {
        let rows = sqlx::query(
            "SELECT payload FROM stream_events
             WHERE stream_key = ?
             ORDER BY timestamp DESC
             LIMIT ?",
        )
        .bind(key)
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(storage)?;

        rows.into_iter()
            .map(|row| {
                let payload: String = row.get("payload");
                serde_json::from_str(&payload)
                    .map_err(|e| EventLogError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn subscribe(
        &self,
        key: &str,
        last_event_id: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<StreamEvent>>, EventLogError> {
        let mut cursor = parse_cursor(last_event_id);

        // Receiver first, snapshot second, so nothing lands in the gap.
        let mut live = self.notify.subscribe();
        let backlog = self.events_after(key, cursor).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        let log = self.clone();
        let key = key.to_string();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            if let Some(last) = backlog.last() {
                cursor = last.timestamp;
                if tx.send(backlog).await.is_err() {
                    return;
                }
            }

            let mut poll = tokio::time::interval(poll_interval);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(key = %key, "subscription cancelled");
                        break;
                    }
                    received = live.recv() => match received {
                        Ok((event_key, event)) => {
                            if event_key != key || event.timestamp <= cursor {
                                continue;
                            }
                            cursor = event.timestamp;
                            if tx.send(vec![event]).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            debug!(key = %key, missed, "notify channel lagged, falling back to poll");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    // Cross-process writes have no notify; poll catches them
                    // (and anything dropped by a lagged channel).
                    _ = poll.tick() => {
                        match log.events_after(&key, cursor).await {
                            Ok(missed) if !missed.is_empty() => {
                                cursor = missed.last().map(|e| e.timestamp).unwrap_or(cursor);
                                if tx.send(missed).await.is_err() {
                                    break;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(key = %key, error = %e, "poll query failed");
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
