//! Operation types for the lifecycle registry.
//!
//! An `Operation` is a tracked unit of cancellable asynchronous work: an agent
//! execution, a server-side runtime run, or a group orchestration stream. All
//! status transitions are monotone and terminal-exclusive; the registry in
//! colloquy-core enforces first-transition-wins semantics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use std::fmt;

use crate::error::OperationFailure;

/// Kind of work an operation represents.
///
/// Wire values match the client protocol (`execAgentRuntime` etc.).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    /// A client-driven agent execution.
    ExecAgentRuntime,
    /// A server-side durable agent execution.
    ExecServerAgentRuntime,
    /// A group orchestration run and its event stream.
    GroupAgentStream,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::ExecAgentRuntime => write!(f, "execAgentRuntime"),
            OperationType::ExecServerAgentRuntime => write!(f, "execServerAgentRuntime"),
            OperationType::GroupAgentStream => write!(f, "groupAgentStream"),
        }
    }
}

/// Lifecycle status of an operation.
///
/// `Cancelled`, `Completed` and `Failed` are terminal: once one of them is
/// set, no further status change is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Cancelled,
    Completed,
    Failed,
}

impl OperationStatus {
    /// Whether this status permits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Cancelled | OperationStatus::Completed | OperationStatus::Failed
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "pending"),
            OperationStatus::Running => write!(f, "running"),
            OperationStatus::Cancelled => write!(f, "cancelled"),
            OperationStatus::Completed => write!(f, "completed"),
            OperationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Conversational references an operation is scoped to.
///
/// All fields are optional; child operations inherit the parent context with
/// partial override at start time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl OperationContext {
    /// Merge `overrides` on top of this context: any field set in `overrides`
    /// wins, unset fields fall back to `self`.
    pub fn merged_with(&self, overrides: &OperationContext) -> OperationContext {
        OperationContext {
            session_id: overrides.session_id.clone().or_else(|| self.session_id.clone()),
            topic_id: overrides.topic_id.clone().or_else(|| self.topic_id.clone()),
            thread_id: overrides.thread_id.clone().or_else(|| self.thread_id.clone()),
            agent_id: overrides.agent_id.clone().or_else(|| self.agent_id.clone()),
            group_id: overrides.group_id.clone().or_else(|| self.group_id.clone()),
            message_id: overrides.message_id.clone().or_else(|| self.message_id.clone()),
        }
    }
}

/// Progress and bookkeeping data attached to an operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMetadata {
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Timestamp (as a string cursor) of the last event the caller observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_human_input: Option<bool>,
    /// Tool calls awaiting human approval, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_status: Option<String>,
    /// Set as soon as a cancel request is received, before the status flips.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_aborting: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationFailure>,
}

/// Partial update merged into [`OperationMetadata`].
///
/// Every `Some` field overwrites the corresponding metadata field; `None`
/// fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub last_event_id: Option<String>,
    pub step_count: Option<u32>,
    pub needs_human_input: Option<bool>,
    pub pending_approval: Option<Value>,
    pub final_status: Option<String>,
    pub is_aborting: Option<bool>,
}

impl OperationMetadata {
    /// Apply a partial patch in place.
    pub fn apply(&mut self, patch: MetadataPatch) {
        if let Some(v) = patch.last_event_id {
            self.last_event_id = Some(v);
        }
        if let Some(v) = patch.step_count {
            self.step_count = Some(v);
        }
        if let Some(v) = patch.needs_human_input {
            self.needs_human_input = Some(v);
        }
        if let Some(v) = patch.pending_approval {
            self.pending_approval = Some(v);
        }
        if let Some(v) = patch.final_status {
            self.final_status = Some(v);
        }
        if let Some(v) = patch.is_aborting {
            self.is_aborting = Some(v);
        }
    }
}

/// A tracked unit of cancellable asynchronous work.
///
/// Parent/child relationships are stored as id lists, never as object
/// references, so the registry stays cycle-free and serializable.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: String,
    pub op_type: OperationType,
    pub status: OperationStatus,
    pub context: OperationContext,
    pub metadata: OperationMetadata,
    pub label: Option<String>,
    pub parent_operation_id: Option<String>,
    pub child_operation_ids: Vec<String>,
    /// Cancellation handle; cancelling it aborts all in-flight work owned by
    /// this operation.
    pub cancellation: CancellationToken,
}

/// Allocate a fresh operation id (`op_` + uuid v7 simple form).
pub fn new_operation_id() -> String {
    format!("op_{}", Uuid::now_v7().simple())
}

/// Handle returned by `start_operation`: the id plus the token the caller
/// uses to observe cancellation.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    pub operation_id: String,
    pub cancellation: CancellationToken,
}

/// Context passed to registered cancel handlers.
#[derive(Debug, Clone)]
pub struct OperationCancelContext {
    pub operation_id: String,
    pub op_type: OperationType,
    pub reason: String,
}

/// Filter for batch cancellation over the live registry.
///
/// All set fields must match (logical AND). Only `Running` operations are
/// considered.
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    pub op_type: Option<OperationType>,
    pub session_id: Option<String>,
    pub topic_id: Option<String>,
    pub thread_id: Option<String>,
    pub group_id: Option<String>,
    pub agent_id: Option<String>,
    pub message_id: Option<String>,
}
