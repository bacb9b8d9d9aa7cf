//! Orchestration triggers.
//!
//! `trigger_speak` / `trigger_broadcast` / `trigger_delegate` are the entry
//! points the supervisor agent's tools call into: each starts a fresh
//! orchestration operation and runs a loop beginning at the named phase.

use std::sync::Arc;

use tracing::debug;

use colloquy_types::operation::{OperationContext, OperationType};
use colloquy_types::orchestration::{
    GroupOrchestrationContext, GroupPhasePayload, OrchestrationState,
};

use super::executors::GroupExecutors;
use super::runtime::GroupOrchestrationRuntime;
use super::supervisor::{BoundedSupervisor, SupervisorInvoker};
use crate::event::EventLog;
use crate::operation::{OperationRegistry, StartOperation};

const DEFAULT_MAX_ROUNDS: u32 = 10;

/// The conversational scope a coordinator serves.
#[derive(Debug, Clone)]
pub struct GroupScope {
    pub group_id: String,
    pub session_id: String,
    pub topic_id: Option<String>,
}

/// Starts and runs group orchestration loops for one group.
pub struct GroupCoordinator<E: EventLog> {
    registry: Arc<OperationRegistry>,
    event_log: Arc<E>,
    executors: Arc<GroupExecutors>,
    invoker: Arc<dyn SupervisorInvoker>,
    scope: GroupScope,
    max_rounds: u32,
}

impl<E: EventLog> GroupCoordinator<E> {
    pub fn new(
        registry: Arc<OperationRegistry>,
        event_log: Arc<E>,
        executors: Arc<GroupExecutors>,
        invoker: Arc<dyn SupervisorInvoker>,
        scope: GroupScope,
    ) -> Self {
        Self {
            registry,
            event_log,
            executors,
            invoker,
            scope,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Supervisor decided to let one agent speak.
    pub async fn trigger_speak(
        &self,
        supervisor_agent_id: &str,
        agent_id: &str,
        instruction: &str,
    ) -> OrchestrationState {
        self.run_from(
            supervisor_agent_id,
            GroupPhasePayload::Speak {
                agent_id: agent_id.to_string(),
                instruction: instruction.to_string(),
            },
        )
        .await
    }

    /// Supervisor decided to broadcast an instruction to several agents.
    pub async fn trigger_broadcast(
        &self,
        supervisor_agent_id: &str,
        agent_ids: &[String],
        instruction: &str,
    ) -> OrchestrationState {
        self.run_from(
            supervisor_agent_id,
            GroupPhasePayload::Broadcast {
                agent_ids: agent_ids.to_vec(),
                instruction: instruction.to_string(),
            },
        )
        .await
    }

    /// Supervisor decided to hand control to another agent.
    pub async fn trigger_delegate(
        &self,
        supervisor_agent_id: &str,
        agent_id: &str,
        reason: &str,
    ) -> OrchestrationState {
        self.run_from(
            supervisor_agent_id,
            GroupPhasePayload::Delegate {
                agent_id: agent_id.to_string(),
                reason: reason.to_string(),
            },
        )
        .await
    }

    async fn run_from(
        &self,
        supervisor_agent_id: &str,
        payload: GroupPhasePayload,
    ) -> OrchestrationState {
        let phase = payload.phase();
        let handle = self.registry.start_operation(
            StartOperation::new(OperationType::GroupAgentStream)
                .context(OperationContext {
                    group_id: Some(self.scope.group_id.clone()),
                    session_id: Some(self.scope.session_id.clone()),
                    topic_id: self.scope.topic_id.clone(),
                    agent_id: Some(supervisor_agent_id.to_string()),
                    ..Default::default()
                })
                .label(format!("Group Orchestration ({phase})")),
        );
        debug!(
            operation_id = %handle.operation_id,
            group_id = %self.scope.group_id,
            %phase,
            "orchestration triggered"
        );

        let supervisor = Arc::new(BoundedSupervisor::new(
            supervisor_agent_id,
            self.invoker.clone(),
        ));
        let runtime = GroupOrchestrationRuntime::new(
            supervisor,
            self.executors.clone(),
            self.event_log.clone(),
            self.registry.clone(),
            self.scope.session_id.clone(),
        );

        let state = OrchestrationState::new(&handle.operation_id, self.max_rounds);
        let context = GroupOrchestrationContext::new(&handle.operation_id, payload);
        runtime.run(state, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use colloquy_types::error::OrchestrationError;
    use colloquy_types::operation::OperationStatus;
    use colloquy_types::orchestration::{
        OrchestrationStatus, PhaseOutcome, SupervisorDecision,
    };

    use crate::event::InMemoryEventLog;
    use crate::group::executors::{GroupExecutor, PhaseStep};
    use crate::group::supervisor::FinishInvoker;

    /// Records which agents each phase executor was invoked for.
    #[derive(Default)]
    struct Recording {
        spoke: Mutex<Vec<String>>,
        delegated: Mutex<Vec<String>>,
    }

    struct SpeakExec(Arc<Recording>);
    struct DelegateExec(Arc<Recording>);

    impl GroupExecutor for SpeakExec {
        fn execute<'a>(
            &'a self,
            payload: &'a GroupPhasePayload,
            _state: &'a OrchestrationState,
        ) -> Pin<Box<dyn Future<Output = Result<PhaseStep, OrchestrationError>> + Send + 'a>>
        {
            Box::pin(async move {
                let GroupPhasePayload::Speak { agent_id, .. } = payload else {
                    return Err(OrchestrationError::Executor("wrong phase".to_string()));
                };
                self.0.spoke.lock().unwrap().push(agent_id.clone());
                Ok(PhaseStep {
                    events: vec![],
                    outcome: PhaseOutcome::AgentSpoke {
                        agent_id: agent_id.clone(),
                    },
                })
            })
        }
    }

    impl GroupExecutor for DelegateExec {
        fn execute<'a>(
            &'a self,
            payload: &'a GroupPhasePayload,
            _state: &'a OrchestrationState,
        ) -> Pin<Box<dyn Future<Output = Result<PhaseStep, OrchestrationError>> + Send + 'a>>
        {
            Box::pin(async move {
                let GroupPhasePayload::Delegate { agent_id, .. } = payload else {
                    return Err(OrchestrationError::Executor("wrong phase".to_string()));
                };
                self.0.delegated.lock().unwrap().push(agent_id.clone());
                Ok(PhaseStep {
                    events: vec![],
                    outcome: PhaseOutcome::Delegated {
                        agent_id: agent_id.clone(),
                    },
                })
            })
        }
    }

    fn coordinator(
        recording: Arc<Recording>,
    ) -> (GroupCoordinator<InMemoryEventLog>, Arc<OperationRegistry>) {
        let registry = Arc::new(OperationRegistry::new());
        let coordinator = GroupCoordinator::new(
            registry.clone(),
            Arc::new(InMemoryEventLog::new()),
            Arc::new(
                GroupExecutors::new()
                    .with_speak(SpeakExec(recording.clone()))
                    .with_delegate(DelegateExec(recording)),
            ),
            Arc::new(FinishInvoker),
            GroupScope {
                group_id: "group-1".to_string(),
                session_id: "sess-1".to_string(),
                topic_id: None,
            },
        );
        (coordinator, registry)
    }

    #[tokio::test]
    async fn trigger_delegate_creates_operation_and_invokes_delegate_executor() {
        let recording = Arc::new(Recording::default());
        let (coordinator, registry) = coordinator(recording.clone());

        let state = coordinator
            .trigger_delegate("sup-1", "agent-2", "handoff")
            .await;

        assert_eq!(state.status, OrchestrationStatus::Done);
        assert_eq!(
            recording.delegated.lock().unwrap().as_slice(),
            ["agent-2".to_string()]
        );

        // A fresh group-stream operation was created and completed.
        let operation = registry.get(&state.operation_id).unwrap();
        assert_eq!(operation.op_type, OperationType::GroupAgentStream);
        assert_eq!(operation.status, OperationStatus::Completed);
        assert_eq!(operation.context.group_id.as_deref(), Some("group-1"));
        assert_eq!(operation.context.agent_id.as_deref(), Some("sup-1"));
    }

    #[tokio::test]
    async fn trigger_speak_runs_one_turn_with_finish_invoker() {
        let recording = Arc::new(Recording::default());
        let (coordinator, _registry) = coordinator(recording.clone());

        let state = coordinator
            .trigger_speak("sup-1", "agent-1", "please respond")
            .await;

        assert_eq!(state.status, OrchestrationStatus::Done);
        assert_eq!(state.orchestration_round, 1);
        assert_eq!(
            recording.spoke.lock().unwrap().as_slice(),
            ["agent-1".to_string()]
        );
    }

    #[tokio::test]
    async fn trigger_broadcast_without_executor_fails_operation() {
        let recording = Arc::new(Recording::default());
        let (coordinator, registry) = coordinator(recording);

        let state = coordinator
            .trigger_broadcast(
                "sup-1",
                &["agent-1".to_string(), "agent-2".to_string()],
                "discuss",
            )
            .await;

        assert_eq!(state.status, OrchestrationStatus::Error);
        assert_eq!(
            registry.get(&state.operation_id).unwrap().status,
            OperationStatus::Failed
        );
    }
}
