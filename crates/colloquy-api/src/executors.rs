//! Group phase executors backed by the execution driver.
//!
//! `speak` and `broadcast` run each named agent as its own child execution
//! through the driver (the agents' stream events land in the session log as
//! usual); `delegate` records the handoff without invoking anyone -- the
//! delegate acts in its own subsequent loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use colloquy_core::driver::CreateOperationParams;
use colloquy_core::group::{GroupExecutor, GroupExecutors, GroupScope, PhaseStep};
use colloquy_types::error::OrchestrationError;
use colloquy_types::orchestration::{GroupPhasePayload, OrchestrationState, PhaseOutcome};

use crate::state::ConcreteDriver;

type StepFuture<'a> =
    Pin<Box<dyn Future<Output = Result<PhaseStep, OrchestrationError>> + Send + 'a>>;

fn executor_error(e: impl std::fmt::Display) -> OrchestrationError {
    OrchestrationError::Executor(e.to_string())
}

async fn run_agent_turn(
    driver: &ConcreteDriver,
    scope: &GroupScope,
    agent_id: &str,
    instruction: &str,
) -> Result<(), OrchestrationError> {
    let handle = driver
        .create_operation(CreateOperationParams {
            session_id: scope.session_id.clone(),
            topic_id: scope.topic_id.clone(),
            agent_id: Some(agent_id.to_string()),
            user_id: None,
            user_message: instruction.to_string(),
            placeholder_message_id: None,
            max_steps: None,
        })
        .await
        .map_err(executor_error)?;

    driver
        .run_to_completion(&handle.operation_id)
        .await
        .map_err(executor_error)?;
    Ok(())
}

struct SpeakExecutor {
    driver: Arc<ConcreteDriver>,
    scope: GroupScope,
}

impl GroupExecutor for SpeakExecutor {
    fn execute<'a>(
        &'a self,
        payload: &'a GroupPhasePayload,
        _state: &'a OrchestrationState,
    ) -> StepFuture<'a> {
        Box::pin(async move {
            let GroupPhasePayload::Speak {
                agent_id,
                instruction,
            } = payload
            else {
                return Err(executor_error("speak executor got a non-speak payload"));
            };

            run_agent_turn(&self.driver, &self.scope, agent_id, instruction).await?;
            Ok(PhaseStep {
                events: vec![],
                outcome: PhaseOutcome::AgentSpoke {
                    agent_id: agent_id.clone(),
                },
            })
        })
    }
}

struct BroadcastExecutor {
    driver: Arc<ConcreteDriver>,
    scope: GroupScope,
}

impl GroupExecutor for BroadcastExecutor {
    fn execute<'a>(
        &'a self,
        payload: &'a GroupPhasePayload,
        _state: &'a OrchestrationState,
    ) -> StepFuture<'a> {
        Box::pin(async move {
            let GroupPhasePayload::Broadcast {
                agent_ids,
                instruction,
            } = payload
            else {
                return Err(executor_error("broadcast executor got a non-broadcast payload"));
            };

            // Agents in the same round have no required relative order;
            // sequential keeps the shared transcript coherent.
            for agent_id in agent_ids {
                run_agent_turn(&self.driver, &self.scope, agent_id, instruction).await?;
            }
            Ok(PhaseStep {
                events: vec![],
                outcome: PhaseOutcome::AgentsBroadcasted {
                    agent_ids: agent_ids.clone(),
                },
            })
        })
    }
}

struct DelegateExecutor;

impl GroupExecutor for DelegateExecutor {
    fn execute<'a>(
        &'a self,
        payload: &'a GroupPhasePayload,
        _state: &'a OrchestrationState,
    ) -> StepFuture<'a> {
        Box::pin(async move {
            let GroupPhasePayload::Delegate { agent_id, .. } = payload else {
                return Err(executor_error("delegate executor got a non-delegate payload"));
            };
            Ok(PhaseStep {
                events: vec![],
                outcome: PhaseOutcome::Delegated {
                    agent_id: agent_id.clone(),
                },
            })
        })
    }
}

/// Build the full executor set for a group scope.
pub fn driver_executors(driver: Arc<ConcreteDriver>, scope: &GroupScope) -> GroupExecutors {
    GroupExecutors::new()
        .with_speak(SpeakExecutor {
            driver: driver.clone(),
            scope: scope.clone(),
        })
        .with_broadcast(BroadcastExecutor {
            driver,
            scope: scope.clone(),
        })
        .with_delegate(DelegateExecutor)
}
