//! Reconnecting SSE consumer.
//!
//! Connects to the stream transport endpoint, parses frames, and tracks the
//! last seen event timestamp. On a dropped connection it reconnects with
//! exponential backoff and `includeHistory=true` from the tracked cursor, so
//! the subscriber sees every event exactly once across reconnects. The loop
//! ends on the terminal `agent_runtime_end` frame or cancellation.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use colloquy_types::event::wire::Frame;

const FRAME_BUFFER: usize = 64;

/// Which log the client follows.
#[derive(Debug, Clone)]
pub enum StreamKey {
    Session(String),
    Operation(String),
}

impl StreamKey {
    fn query_param(&self) -> (&'static str, &str) {
        match self {
            StreamKey::Session(id) => ("sessionId", id),
            StreamKey::Operation(id) => ("operationId", id),
        }
    }
}

/// Connection options.
#[derive(Debug, Clone)]
pub struct StreamClientOptions {
    pub last_event_id: String,
    pub include_history: bool,
    /// Consecutive failed connection attempts before giving up.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for StreamClientOptions {
    fn default() -> Self {
        Self {
            last_event_id: "0".to_string(),
            include_history: false,
            max_retries: 5,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Errors from the stream client.
#[derive(Debug, Error)]
pub enum StreamClientError {
    #[error("stream request failed: {0}")]
    Request(String),

    #[error("gave up after {attempts} failed connection attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Reconnecting SSE client for the agent stream endpoint.
#[derive(Clone)]
pub struct StreamClient {
    http: reqwest::Client,
    base_url: String,
}

impl StreamClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// The stream endpoint URL for a key and cursor.
    pub fn build_url(&self, key: &StreamKey, last_event_id: &str, include_history: bool) -> String {
        let (param, id) = key.query_param();
        format!(
            "{}/api/v1/agent/stream?includeHistory={include_history}&lastEventId={last_event_id}&{param}={id}",
            self.base_url
        )
    }

    /// Connect and stream frames into the returned channel until the stream
    /// terminates, retries are exhausted, or `cancel` fires. Reconnects
    /// request history replay from the tracked cursor.
    pub fn connect(
        &self,
        key: StreamKey,
        options: StreamClientOptions,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let client = self.clone();

        tokio::spawn(async move {
            if let Err(e) = client.run(key, options, tx, cancel).await {
                warn!(error = %e, "stream client stopped");
            }
        });

        rx
    }

    async fn run(
        &self,
        key: StreamKey,
        options: StreamClientOptions,
        tx: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    ) -> Result<(), StreamClientError> {
        let mut last_event_id = options.last_event_id.clone();
        let mut include_history = options.include_history;
        let mut failed_attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let url = self.build_url(&key, &last_event_id, include_history);
            debug!(url = %url, "connecting to stream");

            let response = match self.http.get(&url).send().await {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    return Err(StreamClientError::Request(format!(
                        "server returned {}",
                        response.status()
                    )));
                }
                Err(e) => {
                    failed_attempts += 1;
                    if failed_attempts > options.max_retries {
                        return Err(StreamClientError::RetriesExhausted {
                            attempts: failed_attempts,
                        });
                    }
                    let backoff = options.retry_delay * failed_attempts;
                    warn!(error = %e, attempt = failed_attempts, "connection failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => continue,
                    }
                }
            };

            failed_attempts = 0;
            let mut events = response.bytes_stream().eventsource();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    next = events.next() => match next {
                        Some(Ok(sse)) => {
                            let frame = match Frame::parse(&sse.data) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    warn!(error = %e, "unparseable frame, skipping");
                                    continue;
                                }
                            };

                            let terminal = matches!(&frame, Frame::Event(event) if event.is_terminal());
                            if let Frame::Event(event) = &frame {
                                last_event_id = event.timestamp.to_string();
                            }

                            if tx.send(frame).await.is_err() {
                                return Ok(());
                            }
                            if terminal {
                                debug!("terminal event received, closing");
                                return Ok(());
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "stream read error, reconnecting");
                            break;
                        }
                        None => {
                            debug!("server closed connection, reconnecting");
                            break;
                        }
                    }
                }
            }

            // Resume from the cursor with history replay so the gap between
            // disconnect and reconnect is filled.
            include_history = true;
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(options.retry_delay) => {}
            }
        }
    }
}
