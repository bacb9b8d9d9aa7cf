//! Agent execution state and instruction set.
//!
//! The execution driver runs a plan/execute loop: a `TurnPlanner` inspects
//! the `TurnContext` and emits `AgentInstruction`s, which the runtime
//! executes against the `AgentState`. The state is the only thing persisted
//! between steps, so a paused (waiting-for-human) operation can resume from
//! it alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::fmt;

use crate::error::OperationFailure;
use crate::message::ToolCallPayload;
use crate::provider::{GenerateMessage, GenerateRequest};

/// Execution status of a single agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Idle,
    Running,
    /// Parked until an explicit intervention call; released only by an
    /// external resume, never by a timeout.
    WaitingForHuman,
    Done,
    Error,
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeStatus::Idle => write!(f, "idle"),
            RuntimeStatus::Running => write!(f, "running"),
            RuntimeStatus::WaitingForHuman => write!(f, "waiting_for_human"),
            RuntimeStatus::Done => write!(f, "done"),
            RuntimeStatus::Error => write!(f, "error"),
        }
    }
}

/// Why an agent run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Completed,
    Error,
    MaxSteps,
    WaitingForHuman,
    Cancelled,
}

/// Mutable state of one agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub operation_id: String,
    pub status: RuntimeStatus,
    pub step_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    /// Transcript accumulated across steps, fed back to the provider.
    pub messages: Vec<GenerateMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_tools_calling: Option<Vec<ToolCallPayload>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationFailure>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl AgentState {
    /// Initial state for a new operation.
    pub fn new(operation_id: impl Into<String>, max_steps: Option<u32>) -> Self {
        let now = Utc::now();
        Self {
            operation_id: operation_id.into(),
            status: RuntimeStatus::Idle,
            step_count: 0,
            max_steps,
            messages: Vec::new(),
            pending_tools_calling: None,
            error: None,
            created_at: now,
            last_modified: now,
        }
    }

    /// Whether the run can take another step.
    pub fn can_continue(&self) -> bool {
        match self.status {
            RuntimeStatus::Done | RuntimeStatus::Error | RuntimeStatus::WaitingForHuman => false,
            RuntimeStatus::Idle | RuntimeStatus::Running => self
                .max_steps
                .is_none_or(|max| self.step_count < max),
        }
    }

    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

/// One instruction produced by the planner for the runtime to execute.
#[derive(Debug, Clone)]
pub enum AgentInstruction {
    /// Stream a model generation.
    CallModel(GenerateRequest),
    /// Execute a single tool call.
    CallTool(ToolCallPayload),
    /// Park the run until a human approves or rejects the pending calls.
    RequestApproval(Vec<ToolCallPayload>),
    /// Finish the run.
    Finish {
        reason: CompletionReason,
        detail: Option<String>,
    },
}

/// Which part of the loop produced the current context.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnPhase {
    /// A fresh user message kicked off the run.
    UserInput { message: String },
    /// The model finished a generation.
    ModelResult {
        content: String,
        tool_calls: Vec<ToolCallPayload>,
    },
    /// A tool finished executing.
    ToolResult {
        tool_call_id: String,
        content: String,
        is_success: bool,
    },
    /// A human approved a pending tool call.
    ApprovedTool { tool_call: ToolCallPayload },
}

/// Context handed to the planner on each step.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub phase: TurnPhase,
    pub session_id: String,
}

/// Result of a human intervention request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HumanIntervention {
    /// Approve one pending tool call by id.
    Approve { tool_call_id: String },
    /// Reject the pending calls with a reason.
    Reject { reason: String },
    /// Provide free-form input that continues the run.
    Input { content: String },
}
