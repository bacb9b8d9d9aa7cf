//! In-memory event log for single-process deployments and tests.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use colloquy_types::error::EventLogError;
use colloquy_types::event::{NewStreamEvent, StreamEvent};

use super::clock::SessionClock;
use super::log::{EventLog, parse_cursor};

const BROADCAST_CAPACITY: usize = 1024;
const SUBSCRIBE_BUFFER: usize = 64;

/// Default bounded retention per key.
const DEFAULT_MAX_EVENTS_PER_KEY: usize = 10_000;

struct Inner {
    streams: DashMap<String, Vec<StreamEvent>>,
    channels: DashMap<String, broadcast::Sender<StreamEvent>>,
    clock: SessionClock,
    max_events_per_key: usize,
}

impl Inner {
    fn sender(&self, key: &str) -> broadcast::Sender<StreamEvent> {
        self.channels
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
            .clone()
    }

    fn events_after(&self, key: &str, cursor: i64) -> Vec<StreamEvent> {
        self.streams
            .get(key)
            .map(|events| {
                events
                    .iter()
                    .filter(|event| event.timestamp > cursor)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Event log backed by per-key vectors and a broadcast channel for live
/// fan-out. Cloning shares the underlying storage.
///
/// Subscriptions are gap-free from the cursor: the backlog is snapshotted
/// after the live receiver is created, and a lagged receiver refills from
/// the store instead of skipping events.
#[derive(Clone)]
pub struct InMemoryEventLog {
    inner: Arc<Inner>,
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_MAX_EVENTS_PER_KEY)
    }

    /// Create a log that retains at most `max_events_per_key` events per key,
    /// pruning oldest-first.
    pub fn with_retention(max_events_per_key: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                streams: DashMap::new(),
                channels: DashMap::new(),
                clock: SessionClock::new(),
                max_events_per_key,
            }),
        }
    }

    /// Number of retained events for a key.
    pub fn event_count(&self, key: &str) -> usize {
        self.inner.streams.get(key).map(|v| v.len()).unwrap_or(0)
    }
}

impl EventLog for InMemoryEventLog {
    async fn append(
        &self,
        key: &str,
        event: NewStreamEvent,
    ) -> Result<StreamEvent, EventLogError> {
        let stored = StreamEvent {
            payload: event.payload,
            timestamp: self.inner.clock.next(key),
            operation_id: event.operation_id,
            step_index: event.step_index,
        };

        {
            let mut events = self.inner.streams.entry(key.to_string()).or_default();
            events.push(stored.clone());
            let len = events.len();
            if len > self.inner.max_events_per_key {
                events.drain(..len - self.inner.max_events_per_key);
            }
        }

        // No subscribers is fine; the event stays in history.
        let _ = self.inner.sender(key).send(stored.clone());

        Ok(stored)
    }

    async fn history(&self, key: &str, limit: usize) -> Result<Vec<StreamEvent>, EventLogError> {
        let mut recent: Vec<StreamEvent> = self
            .inner
            .streams
            .get(key)
            .map(|events| {
                let skip = events.len().saturating_sub(limit);
                events[skip..].to_vec()
            })
            .unwrap_or_default();
        recent.reverse();
        Ok(recent)
    }

    async fn subscribe(
        &self,
        key: &str,
        last_event_id: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<StreamEvent>>, EventLogError> {
        let mut cursor = parse_cursor(last_event_id);

        // Receiver first, snapshot second: an event appended in between is
        // either in the snapshot or in the receiver, never lost.
        let mut live = self.inner.sender(key).subscribe();
        let backlog = self.inner.events_after(key, cursor);

        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        let inner = self.inner.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            if let Some(last) = backlog.last() {
                cursor = last.timestamp;
                if tx.send(backlog).await.is_err() {
                    return;
                }
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(key = %key, "subscription cancelled");
                        break;
                    }
                    received = live.recv() => match received {
                        Ok(event) => {
                            if event.timestamp <= cursor {
                                continue;
                            }
                            cursor = event.timestamp;
                            if tx.send(vec![event]).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            debug!(key = %key, missed, "subscriber lagged, refilling from store");
                            let refill = inner.events_after(&key, cursor);
                            if let Some(last) = refill.last() {
                                cursor = last.timestamp;
                                if tx.send(refill).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_types::event::{StreamChunkData, StreamPayload};

    fn chunk(content: &str) -> NewStreamEvent {
        NewStreamEvent::new(
            "op-1",
            StreamPayload::StreamChunk {
                data: StreamChunkData::Text {
                    content: content.to_string(),
                },
            },
        )
    }

    async fn drain(rx: &mut mpsc::Receiver<Vec<StreamEvent>>, expected: usize) -> Vec<StreamEvent> {
        let mut collected = Vec::new();
        while collected.len() < expected {
            let batch = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out waiting for events")
                .expect("subscription closed early");
            collected.extend(batch);
        }
        collected
    }

    #[tokio::test]
    async fn append_assigns_strictly_increasing_timestamps() {
        let log = InMemoryEventLog::new();
        let first = log.append("sess-1", chunk("a")).await.unwrap();
        let second = log.append("sess-1", chunk("b")).await.unwrap();
        assert!(second.timestamp > first.timestamp);
    }

    #[tokio::test]
    async fn history_is_newest_first_and_bounded() {
        let log = InMemoryEventLog::new();
        for i in 0..5 {
            log.append("sess-1", chunk(&i.to_string())).await.unwrap();
        }

        let history = log.history("sess-1", 3).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[0].timestamp > history[1].timestamp);
        assert!(history[1].timestamp > history[2].timestamp);
    }

    #[tokio::test]
    async fn history_for_unknown_key_is_empty() {
        let log = InMemoryEventLog::new();
        assert!(log.history("nope", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retention_prunes_oldest() {
        let log = InMemoryEventLog::with_retention(3);
        for i in 0..10 {
            log.append("sess-1", chunk(&i.to_string())).await.unwrap();
        }
        assert_eq!(log.event_count("sess-1"), 3);

        // The retained events are the newest ones.
        let history = log.history("sess-1", 10).await.unwrap();
        match &history.last().unwrap().payload {
            StreamPayload::StreamChunk {
                data: StreamChunkData::Text { content },
            } => assert_eq!(content, "7"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_replays_backlog_then_live_without_gaps_or_duplicates() {
        let log = InMemoryEventLog::new();
        let mut appended = Vec::new();
        for i in 0..3 {
            appended.push(log.append("sess-1", chunk(&i.to_string())).await.unwrap());
        }

        let cancel = CancellationToken::new();
        let mut rx = log.subscribe("sess-1", "0", cancel.clone()).await.unwrap();

        for i in 3..6 {
            appended.push(log.append("sess-1", chunk(&i.to_string())).await.unwrap());
        }

        let received = drain(&mut rx, 6).await;
        let timestamps: Vec<i64> = received.iter().map(|e| e.timestamp).collect();
        let expected: Vec<i64> = appended.iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, expected);

        // Strictly increasing, so no duplicates and no reordering.
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
        cancel.cancel();
    }

    #[tokio::test]
    async fn subscribe_from_cursor_skips_already_seen() {
        let log = InMemoryEventLog::new();
        let first = log.append("sess-1", chunk("seen")).await.unwrap();
        let second = log.append("sess-1", chunk("new")).await.unwrap();

        let cancel = CancellationToken::new();
        let mut rx = log
            .subscribe("sess-1", &first.timestamp.to_string(), cancel.clone())
            .await
            .unwrap();

        let received = drain(&mut rx, 1).await;
        assert_eq!(received[0].timestamp, second.timestamp);
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancelled_subscription_stops_delivering() {
        let log = InMemoryEventLog::new();
        let cancel = CancellationToken::new();
        let mut rx = log.subscribe("sess-1", "0", cancel.clone()).await.unwrap();

        cancel.cancel();
        // Give the pump a moment to observe cancellation.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        log.append("sess-1", chunk("late")).await.unwrap();

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscribers_on_different_keys_are_isolated() {
        let log = InMemoryEventLog::new();
        let cancel = CancellationToken::new();
        let mut rx = log.subscribe("sess-a", "0", cancel.clone()).await.unwrap();

        log.append("sess-b", chunk("other")).await.unwrap();
        let only = log.append("sess-a", chunk("mine")).await.unwrap();

        let received = drain(&mut rx, 1).await;
        assert_eq!(received[0].timestamp, only.timestamp);
        cancel.cancel();
    }
}
