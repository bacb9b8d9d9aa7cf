//! Group orchestration state machine types.
//!
//! A group run is a bounded loop over phase transitions: the supervisor
//! decides which phase comes next (`speak`, `broadcast`, `delegate`), phase
//! executors invoke the actual agents, and the runtime enforces round bounds
//! and sequencing. `orchestration_round` never exceeds `max_rounds`; reaching
//! the bound forces `Done`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::fmt;

/// State machine status: `pending -> running -> {done | error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestrationStatus::Pending => write!(f, "pending"),
            OrchestrationStatus::Running => write!(f, "running"),
            OrchestrationStatus::Done => write!(f, "done"),
            OrchestrationStatus::Error => write!(f, "error"),
        }
    }
}

/// Phase discriminant of a [`GroupOrchestrationContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationPhase {
    Speak,
    Broadcast,
    Delegate,
}

impl fmt::Display for OrchestrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestrationPhase::Speak => write!(f, "speak"),
            OrchestrationPhase::Broadcast => write!(f, "broadcast"),
            OrchestrationPhase::Delegate => write!(f, "delegate"),
        }
    }
}

/// Phase-specific payload, discriminated by `phase`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum GroupPhasePayload {
    /// One agent is instructed to produce a single turn.
    Speak { agent_id: String, instruction: String },
    /// Several agents each produce a turn in the same round.
    Broadcast {
        agent_ids: Vec<String>,
        instruction: String,
    },
    /// Control is handed to another agent for subsequent decisions.
    Delegate { agent_id: String, reason: String },
}

impl GroupPhasePayload {
    pub fn phase(&self) -> OrchestrationPhase {
        match self {
            GroupPhasePayload::Speak { .. } => OrchestrationPhase::Speak,
            GroupPhasePayload::Broadcast { .. } => OrchestrationPhase::Broadcast,
            GroupPhasePayload::Delegate { .. } => OrchestrationPhase::Delegate,
        }
    }
}

/// Context driving one step of the orchestration loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupOrchestrationContext {
    #[serde(flatten)]
    pub payload: GroupPhasePayload,
    #[serde(rename = "operationId")]
    pub operation_id: String,
}

impl GroupOrchestrationContext {
    pub fn new(operation_id: impl Into<String>, payload: GroupPhasePayload) -> Self {
        Self {
            payload,
            operation_id: operation_id.into(),
        }
    }

    pub fn phase(&self) -> OrchestrationPhase {
        self.payload.phase()
    }
}

/// What a phase executor reports back to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PhaseOutcome {
    AgentSpoke { agent_id: String },
    AgentsBroadcasted { agent_ids: Vec<String> },
    Delegated { agent_id: String },
}

/// The supervisor's verdict after a phase outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorDecision {
    /// Run another phase.
    Continue(GroupPhasePayload),
    /// Stop the loop.
    Finish { reason: String },
}

/// State of one group orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationState {
    pub operation_id: String,
    pub status: OrchestrationStatus,
    /// Completed phase passes. Never exceeds `max_rounds`.
    pub orchestration_round: u32,
    pub max_rounds: u32,
    pub step_count: u32,
    pub last_modified: DateTime<Utc>,
}

impl OrchestrationState {
    pub fn new(operation_id: impl Into<String>, max_rounds: u32) -> Self {
        Self {
            operation_id: operation_id.into(),
            status: OrchestrationStatus::Pending,
            orchestration_round: 0,
            max_rounds,
            step_count: 0,
            last_modified: Utc::now(),
        }
    }

    /// Whether the round bound permits another phase pass.
    pub fn has_rounds_left(&self) -> bool {
        self.orchestration_round < self.max_rounds
    }
}
