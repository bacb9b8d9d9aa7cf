//! The stream transport endpoint.
//!
//! GET /api/v1/agent/stream
//!
//! A long-lived SSE response: connection ack, optional cursor-filtered
//! history replay, live events, and periodic heartbeats. The stream closes
//! immediately after the terminal `agent_runtime_end` event; heartbeats
//! never outlive it.
//!
//! Frame grammar:
//! - ack: `id: conn_<ms>` / `event: connected` / connected JSON
//! - events: `id: <session or operation id>` / `event: <type>` / event JSON
//! - heartbeat: a bare `data:` frame, no id/event
//! - error: `id: error_<ms>` / `event: error` / error JSON

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use colloquy_core::driver::stream_key;
use colloquy_core::event::{EventLog, parse_cursor, replay_after_cursor};
use colloquy_types::event::wire::WireFrame;
use colloquy_types::event::StreamEvent;

use crate::state::AppState;

/// Query parameters for the stream endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    pub session_id: Option<String>,
    pub operation_id: Option<String>,
    pub last_event_id: Option<String>,
    pub include_history: Option<bool>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn frame_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn event_frame(wire_id: &str, event: &StreamEvent) -> Event {
    Event::default()
        .id(wire_id)
        .event(event.event_type())
        .data(frame_json(event))
}

fn error_frame(error: String, phase: &str, session_id: Option<String>) -> Event {
    let timestamp = now_ms();
    let frame = WireFrame::Error {
        error,
        phase: Some(phase.to_string()),
        session_id,
        timestamp,
    };
    Event::default()
        .id(format!("error_{timestamp}"))
        .event("error")
        .data(frame_json(&frame))
}

/// GET /api/v1/agent/stream -- resumable server-push event stream.
pub async fn agent_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Response {
    // One of the two identifiers is required.
    let (wire_id, is_operation) = match (&query.operation_id, &query.session_id) {
        (Some(op), _) if !op.is_empty() => (op.clone(), true),
        (_, Some(session)) if !session.is_empty() => (session.clone(), false),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "sessionId parameter is required" })),
            )
                .into_response();
        }
    };

    // An operation id resolves to the session log it writes into; an unknown
    // operation falls back to its own key (it may simply not have started).
    let log_key = if is_operation {
        state
            .registry
            .get(&wire_id)
            .map(|op| stream_key(&op))
            .unwrap_or_else(|| wire_id.clone())
    } else {
        wire_id.clone()
    };

    let last_event_id = query.last_event_id.clone().unwrap_or_else(|| "0".to_string());
    let include_history = query.include_history.unwrap_or(false);

    // The subscription token closes the stream on terminal events and client
    // disconnects. Deriving it from the operation's own token also closes
    // the wire promptly when the operation is cancelled.
    let sub_cancel = if is_operation {
        state
            .registry
            .cancellation(&wire_id)
            .map(|token| token.child_token())
            .unwrap_or_default()
    } else {
        CancellationToken::new()
    };

    debug!(key = %log_key, %last_event_id, include_history, "stream connected");

    let heartbeat_interval = state.heartbeat_interval;
    let history_limit = state.history_limit;
    let event_log = state.event_log.clone();
    let session_for_frames = query.session_id.clone();

    let stream = async_stream::stream! {
        // Cancel the subscription when the client goes away and this
        // generator is dropped.
        let _guard = sub_cancel.clone().drop_guard();

        // 1. Connection ack, echoing the requested cursor.
        let connected_at = now_ms();
        let ack = WireFrame::Connected {
            session_id: session_for_frames.clone(),
            operation_id: query.operation_id.clone(),
            last_event_id: last_event_id.clone(),
            timestamp: connected_at,
        };
        yield Ok::<_, Infallible>(
            Event::default()
                .id(format!("conn_{connected_at}"))
                .event("connected")
                .data(frame_json(&ack)),
        );

        // Cursor of the newest frame written so far; live events at or below
        // it are duplicates of the history replay and are skipped.
        let mut sent_cursor = parse_cursor(&last_event_id);

        // 2. History replay: newest N, reversed to chronological, filtered
        // strictly after the cursor.
        if include_history {
            match event_log.history(&log_key, history_limit).await {
                Ok(mut events) => {
                    events.reverse();
                    for event in replay_after_cursor(&events, &last_event_id) {
                        sent_cursor = event.timestamp;
                        let terminal = event.is_terminal();
                        yield Ok(event_frame(&wire_id, &event));
                        if terminal {
                            debug!(key = %log_key, "terminal event in history, closing");
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(key = %log_key, error = %e, "history load failed");
                    yield Ok(error_frame(
                        e.to_string(),
                        "history_loading",
                        session_for_frames.clone(),
                    ));
                }
            }
        }

        // 3. Live subscription from the cursor.
        let mut live = match event_log
            .subscribe(&log_key, &last_event_id, sub_cancel.clone())
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                warn!(key = %log_key, error = %e, "subscription failed");
                yield Ok(error_frame(
                    e.to_string(),
                    "subscription",
                    session_for_frames.clone(),
                ));
                return;
            }
        };

        // 4. Heartbeats on a fixed interval until a terminal event.
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = sub_cancel.cancelled() => {
                    debug!(key = %log_key, "stream cancelled");
                    break;
                }
                batch = live.recv() => {
                    let Some(events) = batch else { break };
                    for event in events {
                        if event.timestamp <= sent_cursor {
                            continue;
                        }
                        sent_cursor = event.timestamp;
                        let terminal = event.is_terminal();
                        yield Ok(event_frame(&wire_id, &event));
                        if terminal {
                            debug!(key = %log_key, "terminal event, closing stream");
                            return;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let frame = WireFrame::Heartbeat {
                        session_id: session_for_frames.clone(),
                        timestamp: now_ms(),
                    };
                    // Bare data frame: no id, no event field.
                    yield Ok(Event::default().data(frame_json(&frame)));
                }
            }
        }
    };

    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(
        axum::http::header::CACHE_CONTROL,
        axum::http::HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert(
        axum::http::header::CONNECTION,
        axum::http::HeaderValue::from_static("keep-alive"),
    );
    headers.insert(
        axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
        axum::http::HeaderValue::from_static("*"),
    );
    headers.insert(
        axum::http::header::ACCESS_CONTROL_ALLOW_METHODS,
        axum::http::HeaderValue::from_static("GET"),
    );
    headers.insert(
        axum::http::header::ACCESS_CONTROL_ALLOW_HEADERS,
        axum::http::HeaderValue::from_static("Cache-Control, Last-Event-ID"),
    );
    headers.insert(
        "X-Accel-Buffering",
        axum::http::HeaderValue::from_static("no"),
    );
    response
}
