//! Conversation message types.
//!
//! These model the assistant/user/tool messages that the execution driver
//! materializes and the stream consumer mirrors. Persistence beyond the
//! narrow `MessageStore` seam is an external concern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;

use crate::error::OperationFailure;

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallPayload {
    pub id: String,
    /// Tool identifier (e.g. plugin name).
    pub identifier: String,
    /// API within the tool.
    pub api_name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
}

/// A message in a conversation, as seen by the runtime and the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolCallPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationFailure>,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl NewMessage {
    /// Materialize into a full message with a fresh id and timestamp.
    pub fn into_message(self) -> ConversationMessage {
        ConversationMessage {
            id: format!("msg_{}", Uuid::now_v7().simple()),
            role: self.role,
            content: self.content,
            reasoning: None,
            tools: Vec::new(),
            tool_call_id: self.tool_call_id,
            error: None,
            session_id: self.session_id,
            topic_id: self.topic_id,
            created_at: Utc::now(),
        }
    }
}

/// Partial update applied to a stored message.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub tools: Option<Vec<ToolCallPayload>>,
    pub error: Option<OperationFailure>,
}
