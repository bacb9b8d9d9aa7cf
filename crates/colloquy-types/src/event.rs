//! Stream event taxonomy.
//!
//! `StreamEvent` is the append-only record the runtime writes to the event
//! log and pushes over the wire: a tagged payload plus a per-session
//! monotonic millisecond timestamp and the owning operation id. Events are
//! never mutated after append.
//!
//! Connection acks, heartbeats, and transport errors are wire-level frames
//! (`wire::WireFrame`) -- they complete the protocol taxonomy but are never
//! appended to the log.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use std::fmt;

use crate::agent::CompletionReason;
use crate::message::{ConversationMessage, ToolCallPayload};

/// Phase discriminant for `step_start` / `step_complete` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    HumanApproval,
    ToolExecution,
    ExecutionComplete,
}

/// Data for `agent_runtime_init`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRuntimeInitData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
}

/// Data for `agent_runtime_end` -- the authoritative completion signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRuntimeEndData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<CompletionReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_state: Option<Value>,
}

/// Data for `stream_start`: the assistant message has been materialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStartData {
    pub assistant_message: ConversationMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Data for `stream_chunk`, discriminated by `chunkType`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "chunkType", rename_all = "snake_case")]
pub enum StreamChunkData {
    Text {
        content: String,
    },
    Reasoning {
        reasoning: String,
    },
    ToolsCalling {
        #[serde(rename = "toolsCalling")]
        tools_calling: Vec<ToolCallPayload>,
    },
}

/// Data for `stream_end`: final accumulated content for the message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEndData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_list: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grounding: Option<Value>,
}

/// Data for `step_start`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStartData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<StepPhase>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_approval: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_tools_calling: Option<Vec<ToolCallPayload>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallPayload>,
}

/// Data for `step_complete`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCompleteData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<StepPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step_scheduled: Option<bool>,
}

/// Data for an operation-scoped `error` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Where the failure occurred (e.g. `model_generation`, `tool_execution`,
    /// `step_execution`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// The event payload, discriminated by `type`.
///
/// Consumers match exhaustively; adding a variant is a breaking change to
/// every consumer by design.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamPayload {
    AgentRuntimeInit { data: AgentRuntimeInitData },
    AgentRuntimeEnd { data: AgentRuntimeEndData },
    StreamStart { data: StreamStartData },
    StreamChunk { data: StreamChunkData },
    StreamEnd { data: StreamEndData },
    StepStart { data: StepStartData },
    StepComplete { data: StepCompleteData },
    Error { data: ErrorData },
}

impl StreamPayload {
    /// The wire discriminant for this payload, used as the SSE `event:` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamPayload::AgentRuntimeInit { .. } => "agent_runtime_init",
            StreamPayload::AgentRuntimeEnd { .. } => "agent_runtime_end",
            StreamPayload::StreamStart { .. } => "stream_start",
            StreamPayload::StreamChunk { .. } => "stream_chunk",
            StreamPayload::StreamEnd { .. } => "stream_end",
            StreamPayload::StepStart { .. } => "step_start",
            StreamPayload::StepComplete { .. } => "step_complete",
            StreamPayload::Error { .. } => "error",
        }
    }
}

/// An event as stored in the log and delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(flatten)]
    pub payload: StreamPayload,
    /// Millisecond timestamp, strictly monotonic within a session.
    pub timestamp: i64,
    #[serde(rename = "operationId")]
    pub operation_id: String,
    #[serde(rename = "stepIndex", skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u32>,
}

impl StreamEvent {
    /// Whether this event terminates the stream (`agent_runtime_end`).
    pub fn is_terminal(&self) -> bool {
        matches!(self.payload, StreamPayload::AgentRuntimeEnd { .. })
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

/// An event before the log has assigned its timestamp.
#[derive(Debug, Clone)]
pub struct NewStreamEvent {
    pub payload: StreamPayload,
    pub operation_id: String,
    pub step_index: Option<u32>,
}

impl NewStreamEvent {
    pub fn new(operation_id: impl Into<String>, payload: StreamPayload) -> Self {
        Self {
            payload,
            operation_id: operation_id.into(),
            step_index: None,
        }
    }

    pub fn with_step(mut self, step_index: u32) -> Self {
        self.step_index = Some(step_index);
        self
    }
}

pub mod wire {
    //! Wire-level frames that are pushed over SSE but never logged.

    use serde::{Deserialize, Serialize};

    use super::StreamEvent;

    /// Transport frames: connection ack, heartbeat, transport error.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
    pub enum WireFrame {
        Connected {
            #[serde(skip_serializing_if = "Option::is_none")]
            session_id: Option<String>,
            #[serde(skip_serializing_if = "Option::is_none")]
            operation_id: Option<String>,
            last_event_id: String,
            timestamp: i64,
        },
        Heartbeat {
            #[serde(skip_serializing_if = "Option::is_none")]
            session_id: Option<String>,
            timestamp: i64,
        },
        Error {
            error: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            phase: Option<String>,
            #[serde(skip_serializing_if = "Option::is_none")]
            session_id: Option<String>,
            timestamp: i64,
        },
    }

    /// Anything a consumer can receive on the wire.
    #[derive(Debug, Clone)]
    pub enum Frame {
        Event(StreamEvent),
        Wire(WireFrame),
    }

    impl Frame {
        /// Dispatch an inbound SSE `data:` payload.
        ///
        /// `connected` and `heartbeat` are always transport frames. An `error`
        /// payload is an operation event when it carries an `operationId` and
        /// a transport frame otherwise.
        pub fn parse(data: &str) -> Result<Frame, serde_json::Error> {
            let value: serde_json::Value = serde_json::from_str(data)?;
            let frame_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

            let is_wire = match frame_type {
                "connected" | "heartbeat" => true,
                "error" => value.get("operationId").is_none(),
                _ => false,
            };

            if is_wire {
                Ok(Frame::Wire(serde_json::from_value(value)?))
            } else {
                Ok(Frame::Event(serde_json::from_value(value)?))
            }
        }
    }
}

impl fmt::Display for StreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ({})",
            self.event_type(),
            self.timestamp,
            self.operation_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::wire::{Frame, WireFrame};
    use super::*;
    use crate::message::{MessageRole, NewMessage};

    fn chunk_event(content: &str, timestamp: i64) -> StreamEvent {
        StreamEvent {
            payload: StreamPayload::StreamChunk {
                data: StreamChunkData::Text {
                    content: content.to_string(),
                },
            },
            timestamp,
            operation_id: "op-1".to_string(),
            step_index: Some(0),
        }
    }

    #[test]
    fn stream_chunk_serializes_to_wire_shape() {
        let json = serde_json::to_value(chunk_event("world", 250)).unwrap();
        assert_eq!(json["type"], "stream_chunk");
        assert_eq!(json["timestamp"], 250);
        assert_eq!(json["operationId"], "op-1");
        assert_eq!(json["stepIndex"], 0);
        assert_eq!(json["data"]["chunkType"], "text");
        assert_eq!(json["data"]["content"], "world");
    }

    #[test]
    fn reasoning_and_tools_chunks_round_trip() {
        let reasoning = StreamPayload::StreamChunk {
            data: StreamChunkData::Reasoning {
                reasoning: "thinking".to_string(),
            },
        };
        let json = serde_json::to_value(&reasoning).unwrap();
        assert_eq!(json["data"]["chunkType"], "reasoning");

        let tools = StreamPayload::StreamChunk {
            data: StreamChunkData::ToolsCalling {
                tools_calling: vec![ToolCallPayload {
                    id: "call-1".to_string(),
                    identifier: "web".to_string(),
                    api_name: "search".to_string(),
                    arguments: "{}".to_string(),
                }],
            },
        };
        let json = serde_json::to_value(&tools).unwrap();
        assert_eq!(json["data"]["chunkType"], "tools_calling");
        assert_eq!(json["data"]["toolsCalling"][0]["apiName"], "search");

        let parsed: StreamPayload = serde_json::from_value(json).unwrap();
        assert!(matches!(
            parsed,
            StreamPayload::StreamChunk {
                data: StreamChunkData::ToolsCalling { .. }
            }
        ));
    }

    #[test]
    fn stream_start_carries_assistant_message() {
        let message = NewMessage {
            role: MessageRole::Assistant,
            content: String::new(),
            session_id: "sess-1".to_string(),
            topic_id: None,
            tool_call_id: None,
        }
        .into_message();

        let event = StreamEvent {
            payload: StreamPayload::StreamStart {
                data: StreamStartData {
                    assistant_message: message.clone(),
                    model: Some("sonnet".to_string()),
                    provider: None,
                },
            },
            timestamp: 150,
            operation_id: "op-1".to_string(),
            step_index: Some(0),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stream_start");
        assert_eq!(json["data"]["assistantMessage"]["id"], message.id);
        assert_eq!(json["data"]["model"], "sonnet");
    }

    #[test]
    fn agent_runtime_end_is_terminal() {
        let end = StreamEvent {
            payload: StreamPayload::AgentRuntimeEnd {
                data: AgentRuntimeEndData {
                    status: Some("completed".to_string()),
                    ..Default::default()
                },
            },
            timestamp: 300,
            operation_id: "op-1".to_string(),
            step_index: None,
        };
        assert!(end.is_terminal());
        assert!(!chunk_event("x", 1).is_terminal());
    }

    #[test]
    fn step_start_human_approval_shape() {
        let payload = StreamPayload::StepStart {
            data: StepStartData {
                phase: Some(StepPhase::HumanApproval),
                requires_approval: true,
                pending_tools_calling: Some(vec![]),
                tool_call: None,
            },
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["data"]["phase"], "human_approval");
        assert_eq!(json["data"]["requiresApproval"], true);
    }

    #[test]
    fn wire_frame_connected_shape() {
        let frame = WireFrame::Connected {
            session_id: Some("sess-1".to_string()),
            operation_id: None,
            last_event_id: "0".to_string(),
            timestamp: 1_758_203_237_000,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["sessionId"], "sess-1");
        assert_eq!(json["lastEventId"], "0");
    }

    #[test]
    fn frame_parse_dispatches_wire_and_event() {
        let connected = r#"{"type":"connected","sessionId":"s","lastEventId":"0","timestamp":1}"#;
        assert!(matches!(
            Frame::parse(connected).unwrap(),
            Frame::Wire(WireFrame::Connected { .. })
        ));

        let heartbeat = r#"{"type":"heartbeat","sessionId":"s","timestamp":2}"#;
        assert!(matches!(
            Frame::parse(heartbeat).unwrap(),
            Frame::Wire(WireFrame::Heartbeat { .. })
        ));

        let chunk = serde_json::to_string(&chunk_event("hi", 10)).unwrap();
        assert!(matches!(Frame::parse(&chunk).unwrap(), Frame::Event(_)));
    }

    #[test]
    fn frame_parse_splits_error_by_operation_id() {
        let transport =
            r#"{"type":"error","error":"history load failed","phase":"history_loading","timestamp":3}"#;
        assert!(matches!(
            Frame::parse(transport).unwrap(),
            Frame::Wire(WireFrame::Error { .. })
        ));

        let event = StreamEvent {
            payload: StreamPayload::Error {
                data: ErrorData {
                    error: "model exploded".to_string(),
                    message: None,
                    phase: Some("model_generation".to_string()),
                },
            },
            timestamp: 4,
            operation_id: "op-1".to_string(),
            step_index: Some(2),
        };
        let json = serde_json::to_string(&event).unwrap();
        match Frame::parse(&json).unwrap() {
            Frame::Event(e) => assert_eq!(e.event_type(), "error"),
            other => panic!("expected event frame, got {other:?}"),
        }
    }
}
