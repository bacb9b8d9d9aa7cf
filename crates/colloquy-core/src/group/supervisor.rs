//! The supervisor decision function.
//!
//! The supervisor agent decides phase transitions; the runtime only enforces
//! bounds and sequencing. `BoundedSupervisor` wraps the actual
//! decision-maker (an LLM-backed supervisor agent, behind
//! `SupervisorInvoker`) with the protocol rules: a delegation always ends
//! the loop, and a single-turn run finishes after its first phase.

use std::future::Future;
use std::pin::Pin;

use tracing::debug;

use colloquy_types::error::OrchestrationError;
use colloquy_types::orchestration::{OrchestrationState, PhaseOutcome, SupervisorDecision};

type DecisionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<SupervisorDecision, OrchestrationError>> + Send + 'a>>;

/// Decides what happens after a phase outcome.
pub trait OrchestrationSupervisor: Send + Sync {
    fn decide<'a>(
        &'a self,
        outcome: &'a PhaseOutcome,
        state: &'a OrchestrationState,
    ) -> DecisionFuture<'a>;
}

/// The seam to the actual supervisor agent: given the last outcome, produce
/// the next move. In production this runs the supervisor agent through the
/// execution driver and maps its tool invocation to a decision; tests script
/// it directly.
pub trait SupervisorInvoker: Send + Sync {
    fn next_move<'a>(
        &'a self,
        outcome: &'a PhaseOutcome,
        state: &'a OrchestrationState,
    ) -> DecisionFuture<'a>;
}

/// An invoker that always finishes. Used when no supervisor agent is wired
/// in: every trigger runs exactly one phase.
pub struct FinishInvoker;

impl SupervisorInvoker for FinishInvoker {
    fn next_move<'a>(
        &'a self,
        _outcome: &'a PhaseOutcome,
        _state: &'a OrchestrationState,
    ) -> DecisionFuture<'a> {
        Box::pin(async { Ok(SupervisorDecision::Finish {
            reason: "no supervisor configured".to_string(),
        }) })
    }
}

/// Protocol rules around the supervisor agent.
pub struct BoundedSupervisor {
    pub supervisor_agent_id: String,
    /// Finish after the first phase instead of consulting the supervisor.
    pub single_turn: bool,
    invoker: std::sync::Arc<dyn SupervisorInvoker>,
}

impl BoundedSupervisor {
    pub fn new(
        supervisor_agent_id: impl Into<String>,
        invoker: std::sync::Arc<dyn SupervisorInvoker>,
    ) -> Self {
        Self {
            supervisor_agent_id: supervisor_agent_id.into(),
            single_turn: false,
            invoker,
        }
    }

    pub fn single_turn(mut self, single_turn: bool) -> Self {
        self.single_turn = single_turn;
        self
    }
}

impl OrchestrationSupervisor for BoundedSupervisor {
    fn decide<'a>(
        &'a self,
        outcome: &'a PhaseOutcome,
        state: &'a OrchestrationState,
    ) -> DecisionFuture<'a> {
        Box::pin(async move {
            // Delegation hands control off; the current loop always ends.
            if let PhaseOutcome::Delegated { agent_id } = outcome {
                debug!(agent_id, "delegation ends the loop");
                return Ok(SupervisorDecision::Finish {
                    reason: format!("delegated_to_{agent_id}"),
                });
            }

            if self.single_turn {
                return Ok(SupervisorDecision::Finish {
                    reason: "single_turn".to_string(),
                });
            }

            self.invoker.next_move(outcome, state).await
        })
    }
}
