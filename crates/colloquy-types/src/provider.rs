//! Narrow "generate" boundary to the model provider.
//!
//! The runtime never implements inference; it consumes a streaming generate
//! capability and translates its chunks into stream events. Concrete provider
//! adapters live outside this workspace.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{MessageRole, ToolCallPayload};

/// One message of model input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateMessage {
    pub role: MessageRole,
    pub content: String,
}

/// A streaming generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub model: String,
    pub messages: Vec<GenerateMessage>,
    /// Tool manifests offered to the model, as opaque JSON.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<serde_json::Value>,
}

/// An incremental chunk from the provider's streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerateChunk {
    /// Assistant text delta.
    Text(String),
    /// Reasoning/thinking delta.
    Reasoning(String),
    /// The model requested tool invocations (full set, not a delta).
    ToolCalls(Vec<ToolCallPayload>),
    /// The stream finished.
    Done,
}

/// Errors from the provider boundary.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider stream interrupted: {0}")]
    Stream(String),

    #[error("rate limited")]
    RateLimited,
}
