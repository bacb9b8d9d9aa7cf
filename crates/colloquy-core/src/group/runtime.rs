//! The bounded orchestration loop.
//!
//! `step` is an explicit transition function over `(state, context)`; `run`
//! drives it in a plain `while` loop with a cancellation check before every
//! iteration, so the state machine stays inspectable and testable without
//! relying on task suspension.

use std::sync::Arc;

use tracing::{debug, warn};

use colloquy_types::error::{FailureKind, OperationFailure, OrchestrationError};
use colloquy_types::event::{
    NewStreamEvent, StepCompleteData, StepStartData, StreamEvent, StreamPayload,
};
use colloquy_types::orchestration::{
    GroupOrchestrationContext, OrchestrationState, OrchestrationStatus, SupervisorDecision,
};

use super::executors::GroupExecutors;
use super::supervisor::OrchestrationSupervisor;
use crate::event::EventLog;
use crate::operation::OperationRegistry;

/// Result of one phase pass.
#[derive(Debug)]
pub struct OrchestrationStepOutput {
    pub new_state: OrchestrationState,
    /// Events produced by the pass, already stamped and appended.
    pub events: Vec<StreamEvent>,
    /// `None` ends the loop.
    pub next_context: Option<GroupOrchestrationContext>,
}

/// Bounded, supervisor-directed state machine over group phases.
pub struct GroupOrchestrationRuntime<E: EventLog> {
    supervisor: Arc<dyn OrchestrationSupervisor>,
    executors: Arc<GroupExecutors>,
    event_log: Arc<E>,
    registry: Arc<OperationRegistry>,
    /// Session key events are appended under.
    session_key: String,
}

impl<E: EventLog> GroupOrchestrationRuntime<E> {
    pub fn new(
        supervisor: Arc<dyn OrchestrationSupervisor>,
        executors: Arc<GroupExecutors>,
        event_log: Arc<E>,
        registry: Arc<OperationRegistry>,
        session_key: impl Into<String>,
    ) -> Self {
        Self {
            supervisor,
            executors,
            event_log,
            registry,
            session_key: session_key.into(),
        }
    }

    /// Execute one phase pass: bump the round (or finish if the bound is
    /// reached), run the phase executor, append its events, and ask the
    /// supervisor for the next move.
    pub async fn step(
        &self,
        state: &OrchestrationState,
        context: GroupOrchestrationContext,
    ) -> Result<OrchestrationStepOutput, OrchestrationError> {
        let mut new_state = state.clone();
        new_state.step_count += 1;
        new_state.last_modified = chrono::Utc::now();

        // Round bound reached (including max_rounds == 0): terminate
        // deterministically with no phase events.
        if !new_state.has_rounds_left() {
            debug!(
                operation_id = %new_state.operation_id,
                max_rounds = new_state.max_rounds,
                "round bound reached, forcing done"
            );
            new_state.status = OrchestrationStatus::Done;
            return Ok(OrchestrationStepOutput {
                new_state,
                events: Vec::new(),
                next_context: None,
            });
        }

        new_state.status = OrchestrationStatus::Running;
        new_state.orchestration_round += 1;

        let phase = context.phase();
        let executor = self.executors.resolve(phase)?;

        let mut appended = Vec::new();
        appended.push(
            self.append(
                &context.operation_id,
                new_state.step_count,
                StreamPayload::StepStart {
                    data: StepStartData::default(),
                },
            )
            .await?,
        );

        let phase_step = executor.execute(&context.payload, &new_state).await?;
        for event in phase_step.events {
            appended.push(
                self.event_log
                    .append(&self.session_key, event)
                    .await
                    .map_err(OrchestrationError::EventLog)?,
            );
        }

        let decision = self.supervisor.decide(&phase_step.outcome, &new_state).await?;

        let (next_context, finish_reason) = match decision {
            SupervisorDecision::Continue(payload) => (
                Some(GroupOrchestrationContext::new(
                    context.operation_id.clone(),
                    payload,
                )),
                None,
            ),
            SupervisorDecision::Finish { reason } => {
                new_state.status = OrchestrationStatus::Done;
                (None, Some(reason))
            }
        };

        appended.push(
            self.append(
                &context.operation_id,
                new_state.step_count,
                StreamPayload::StepComplete {
                    data: StepCompleteData {
                        result: Some(serde_json::json!({
                            "phase": phase.to_string(),
                            "outcome": phase_step.outcome,
                            "round": new_state.orchestration_round,
                            "finishReason": finish_reason,
                        })),
                        next_step_scheduled: Some(next_context.is_some()),
                        ..Default::default()
                    },
                },
            )
            .await?,
        );

        debug!(
            operation_id = %new_state.operation_id,
            %phase,
            round = new_state.orchestration_round,
            status = %new_state.status,
            "phase pass complete"
        );

        Ok(OrchestrationStepOutput {
            new_state,
            events: appended,
            next_context,
        })
    }

    /// Run the loop from an initial context until done, error, or
    /// cancellation. Cancellation forces `Done` (not `Error`) with no
    /// further side effects; a step failure transitions to `Error` and fails
    /// the owning operation, retaining the events already appended.
    pub async fn run(
        &self,
        mut state: OrchestrationState,
        initial_context: GroupOrchestrationContext,
    ) -> OrchestrationState {
        let operation_id = initial_context.operation_id.clone();
        let cancel = self.registry.cancellation(&operation_id);

        let mut context = Some(initial_context);
        while let Some(step_context) = context.take() {
            if cancel.as_ref().is_some_and(|token| token.is_cancelled()) {
                debug!(operation_id = %operation_id, "orchestration cancelled, stopping loop");
                state.status = OrchestrationStatus::Done;
                return state;
            }

            match self.step(&state, step_context).await {
                Ok(output) => {
                    state = output.new_state;
                    context = output.next_context;
                }
                Err(e) => {
                    warn!(operation_id = %operation_id, error = %e, "orchestration step failed");
                    state.status = OrchestrationStatus::Error;
                    self.registry.fail_operation(
                        &operation_id,
                        OperationFailure::new(
                            FailureKind::Orchestration,
                            "Group orchestration execution failed",
                        ),
                    );
                    return state;
                }
            }

            if state.status != OrchestrationStatus::Running {
                break;
            }
        }

        if state.status == OrchestrationStatus::Done {
            self.registry.complete_operation(&operation_id);
        }
        state
    }

    async fn append(
        &self,
        operation_id: &str,
        step_index: u32,
        payload: StreamPayload,
    ) -> Result<StreamEvent, OrchestrationError> {
        self.event_log
            .append(
                &self.session_key,
                NewStreamEvent::new(operation_id.to_string(), payload).with_step(step_index),
            )
            .await
            .map_err(OrchestrationError::EventLog)
    }
}
