//! Error taxonomy for the Colloquy runtime.
//!
//! `FailureKind`/`OperationFailure` are the typed failure surface recorded on
//! operations and pushed over the wire. The remaining enums are component
//! errors propagated with `?` inside the runtime; they are converted into an
//! `OperationFailure` (never an escaped panic) at the driver and
//! orchestration boundaries.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt;

/// Classification of an operation failure.
///
/// Wire values are fixed by the client protocol, which mixes Pascal-case
/// error names with the snake-case `orchestration_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The backend failed to enqueue or start the operation.
    #[serde(rename = "AgentStartupError")]
    AgentStartup,
    /// A failure during a running agent step.
    #[serde(rename = "AgentExecutionError")]
    AgentExecution,
    /// A transport-level failure subscribing to or reading the event stream.
    #[serde(rename = "AgentStreamError")]
    AgentStream,
    /// The group state-machine loop failed.
    #[serde(rename = "orchestration_error")]
    Orchestration,
    /// Fallback for unclassified failures.
    #[serde(rename = "UnknownError")]
    Unknown,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::AgentStartup => write!(f, "AgentStartupError"),
            FailureKind::AgentExecution => write!(f, "AgentExecutionError"),
            FailureKind::AgentStream => write!(f, "AgentStreamError"),
            FailureKind::Orchestration => write!(f, "orchestration_error"),
            FailureKind::Unknown => write!(f, "UnknownError"),
        }
    }
}

/// A typed failure recorded against an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationFailure {
    #[serde(rename = "type")]
    pub kind: FailureKind,
    pub message: String,
}

impl OperationFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Errors from the event log.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("event stream closed")]
    Closed,
}

/// Errors from the agent execution driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("provider error: {0}")]
    Provider(#[from] crate::provider::ProviderError),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool '{name}' failed: {message}")]
    ToolFailed { name: String, message: String },

    #[error("agent state not found for operation {0}")]
    StateNotFound(String),

    #[error("operation {0} is not waiting for human input")]
    NotWaitingForHuman(String),

    #[error("event log error: {0}")]
    EventLog(#[from] EventLogError),

    #[error("message store error: {0}")]
    MessageStore(String),

    #[error("execution cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl DriverError {
    /// Collapse into the wire-level failure taxonomy.
    pub fn to_failure(&self) -> OperationFailure {
        let kind = match self {
            DriverError::EventLog(_) => FailureKind::AgentStream,
            DriverError::Internal(_) => FailureKind::Unknown,
            _ => FailureKind::AgentExecution,
        };
        OperationFailure::new(kind, self.to_string())
    }
}

/// Errors from the group orchestration runtime.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("no executor registered for phase: {0}")]
    ExecutorMissing(String),

    #[error("phase executor failed: {0}")]
    Executor(String),

    #[error("supervisor decision failed: {0}")]
    Supervisor(String),

    #[error("event log error: {0}")]
    EventLog(#[from] EventLogError),

    #[error("operation not found: {0}")]
    OperationNotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_wire_values() {
        let cases = [
            (FailureKind::AgentStartup, "\"AgentStartupError\""),
            (FailureKind::AgentExecution, "\"AgentExecutionError\""),
            (FailureKind::AgentStream, "\"AgentStreamError\""),
            (FailureKind::Orchestration, "\"orchestration_error\""),
            (FailureKind::Unknown, "\"UnknownError\""),
        ];
        for (kind, expected) in cases {
            assert_eq!(serde_json::to_string(&kind).unwrap(), expected);
        }
    }

    #[test]
    fn operation_failure_serializes_kind_as_type() {
        let failure = OperationFailure::new(FailureKind::AgentExecution, "model timed out");
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["type"], "AgentExecutionError");
        assert_eq!(json["message"], "model timed out");
    }

    #[test]
    fn driver_error_failure_mapping() {
        let err = DriverError::ToolNotFound("search".to_string());
        assert_eq!(err.to_failure().kind, FailureKind::AgentExecution);

        let err = DriverError::EventLog(EventLogError::Closed);
        assert_eq!(err.to_failure().kind, FailureKind::AgentStream);

        let err = DriverError::Internal("boom".to_string());
        assert_eq!(err.to_failure().kind, FailureKind::Unknown);
    }
}
