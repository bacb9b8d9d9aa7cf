//! The execution driver: operation-scoped run loop around `AgentRuntime`.
//!
//! Owns the per-operation agent states, checks cancellation before every
//! step, pauses on human-approval gates, and is the only publisher of
//! `agent_runtime_init` / `agent_runtime_end` and operation-level `error`
//! events. Step failures are converted into a single typed `error` event
//! plus `fail_operation` -- they never escape to the transport layer.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, warn};

use colloquy_types::agent::{
    AgentState, CompletionReason, HumanIntervention, RuntimeStatus, TurnContext, TurnPhase,
};
use colloquy_types::error::{DriverError, FailureKind, OperationFailure};
use colloquy_types::event::{
    AgentRuntimeEndData, AgentRuntimeInitData, ErrorData, NewStreamEvent, StepCompleteData,
    StepStartData, StreamPayload,
};
use colloquy_types::message::{MessageRole, NewMessage};
use colloquy_types::operation::{
    MetadataPatch, Operation, OperationContext, OperationHandle, OperationType,
};
use colloquy_types::provider::GenerateMessage;

use super::planner::TurnPlanner;
use super::provider::GenerateProvider;
use super::runtime::AgentRuntime;
use super::store::MessageStore;
use super::tools::ToolExecutor;
use crate::event::EventLog;
use crate::operation::{OperationRegistry, StartOperation};

const DEFAULT_MAX_STEPS: u32 = 50;

/// The log key an operation's events are appended under: the session when
/// there is one, otherwise the operation id itself. The transport endpoint
/// resolves incoming `operationId` queries the same way.
pub fn stream_key(operation: &Operation) -> String {
    operation
        .context
        .session_id
        .clone()
        .unwrap_or_else(|| operation.id.clone())
}

/// Parameters for starting an agent execution.
#[derive(Debug, Clone)]
pub struct CreateOperationParams {
    pub session_id: String,
    pub topic_id: Option<String>,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub user_message: String,
    /// Optimistic placeholder to delete if startup fails.
    pub placeholder_message_id: Option<String>,
    pub max_steps: Option<u32>,
}

/// Status snapshot combining registry and agent state.
#[derive(Debug, Clone)]
pub struct OperationSnapshot {
    pub operation: Operation,
    pub state: AgentState,
}

/// Drives agent executions end to end.
pub struct ExecutionDriver<E, S, T, P>
where
    E: EventLog,
    S: MessageStore,
    T: ToolExecutor,
    P: TurnPlanner,
{
    registry: Arc<OperationRegistry>,
    event_log: Arc<E>,
    message_store: Arc<S>,
    runtime: AgentRuntime<E, S, T, P>,
    states: DashMap<String, AgentState>,
}

impl<E, S, T, P> ExecutionDriver<E, S, T, P>
where
    E: EventLog,
    S: MessageStore,
    T: ToolExecutor,
    P: TurnPlanner,
{
    pub fn new(
        registry: Arc<OperationRegistry>,
        event_log: Arc<E>,
        message_store: Arc<S>,
        tools: Arc<T>,
        planner: Arc<P>,
        provider: Arc<dyn GenerateProvider>,
    ) -> Self {
        let runtime = AgentRuntime::new(
            event_log.clone(),
            message_store.clone(),
            tools,
            planner,
            provider,
        );
        Self {
            registry,
            event_log,
            message_store,
            runtime,
            states: DashMap::new(),
        }
    }

    /// Register a new operation, persist the user message, seed the agent
    /// state, and publish `agent_runtime_init`.
    ///
    /// A failure in here is a startup failure (`AgentStartupError`): the
    /// operation is failed, the optimistic placeholder is deleted rather
    /// than left dangling, and the error is returned.
    pub async fn create_operation(
        &self,
        params: CreateOperationParams,
    ) -> Result<OperationHandle, DriverError> {
        let user_message = self
            .message_store
            .create_message(NewMessage {
                role: MessageRole::User,
                content: params.user_message.clone(),
                session_id: params.session_id.clone(),
                topic_id: params.topic_id.clone(),
                tool_call_id: None,
            })
            .await?;

        let handle = self.registry.start_operation(
            StartOperation::new(OperationType::ExecServerAgentRuntime)
                .context(OperationContext {
                    session_id: Some(params.session_id.clone()),
                    topic_id: params.topic_id.clone(),
                    agent_id: params.agent_id.clone(),
                    message_id: Some(user_message.id.clone()),
                    ..Default::default()
                })
                .label("Agent Execution"),
        );

        let max_steps = params.max_steps.unwrap_or(DEFAULT_MAX_STEPS);
        let mut state = AgentState::new(&handle.operation_id, Some(max_steps));
        state.messages.push(GenerateMessage {
            role: MessageRole::User,
            content: params.user_message.clone(),
        });

        let init = self
            .event_log
            .append(
                &params.session_id,
                NewStreamEvent::new(
                    handle.operation_id.clone(),
                    StreamPayload::AgentRuntimeInit {
                        data: AgentRuntimeInitData {
                            user_id: params.user_id.clone(),
                            model: None,
                            max_steps: Some(max_steps),
                        },
                    },
                )
                .with_step(0),
            )
            .await;

        if let Err(e) = init {
            warn!(operation_id = %handle.operation_id, error = %e, "startup failed");
            self.registry.fail_operation(
                &handle.operation_id,
                OperationFailure::new(FailureKind::AgentStartup, e.to_string()),
            );
            if let Some(placeholder) = &params.placeholder_message_id {
                let _ = self.message_store.delete_message(placeholder).await;
            }
            return Err(e.into());
        }

        self.states.insert(handle.operation_id.clone(), state);
        debug!(operation_id = %handle.operation_id, "operation created");
        Ok(handle)
    }

    /// Run the operation's step loop until it finishes, errors, pauses for
    /// human input, or is cancelled. Never returns a step error: failures
    /// are recorded on the operation and the returned state.
    pub async fn run_to_completion(&self, operation_id: &str) -> Result<AgentState, DriverError> {
        let state = self
            .states
            .get(operation_id)
            .map(|s| s.clone())
            .ok_or_else(|| DriverError::StateNotFound(operation_id.to_string()))?;

        let context = Self::initial_context(&state)?;
        self.run_loop(operation_id, state, context).await
    }

    /// Release a `WaitingForHuman` pause and continue the run.
    pub async fn resume_with_intervention(
        &self,
        operation_id: &str,
        intervention: HumanIntervention,
    ) -> Result<AgentState, DriverError> {
        let mut state = self
            .states
            .get(operation_id)
            .map(|s| s.clone())
            .ok_or_else(|| DriverError::StateNotFound(operation_id.to_string()))?;

        if state.status != RuntimeStatus::WaitingForHuman {
            return Err(DriverError::NotWaitingForHuman(operation_id.to_string()));
        }

        let session_id = self.session_id(operation_id);
        let pending = state.pending_tools_calling.take().unwrap_or_default();

        let context = match intervention {
            HumanIntervention::Approve { tool_call_id } => {
                let tool_call = pending
                    .into_iter()
                    .find(|call| call.id == tool_call_id)
                    .ok_or_else(|| {
                        DriverError::Internal(format!("no pending tool call: {tool_call_id}"))
                    })?;
                TurnContext {
                    phase: TurnPhase::ApprovedTool { tool_call },
                    session_id,
                }
            }
            HumanIntervention::Reject { reason } => {
                let first = pending.first().cloned().ok_or_else(|| {
                    DriverError::Internal("no pending tool calls to reject".to_string())
                })?;
                let content = format!("Tool call rejected by user: {reason}");
                state.messages.push(GenerateMessage {
                    role: MessageRole::Tool,
                    content: content.clone(),
                });
                TurnContext {
                    phase: TurnPhase::ToolResult {
                        tool_call_id: first.id,
                        content,
                        is_success: false,
                    },
                    session_id,
                }
            }
            HumanIntervention::Input { content } => {
                state.messages.push(GenerateMessage {
                    role: MessageRole::User,
                    content: content.clone(),
                });
                TurnContext {
                    phase: TurnPhase::UserInput { message: content },
                    session_id,
                }
            }
        };

        state.status = RuntimeStatus::Running;
        self.registry.update_metadata(
            operation_id,
            MetadataPatch {
                needs_human_input: Some(false),
                pending_approval: Some(serde_json::Value::Null),
                ..Default::default()
            },
        );
        self.save(operation_id, &state);

        self.run_loop(operation_id, state, context).await
    }

    /// Latest state + registry snapshot for an operation.
    pub fn operation_status(&self, operation_id: &str) -> Option<OperationSnapshot> {
        let operation = self.registry.get(operation_id)?;
        let state = self.states.get(operation_id)?.clone();
        Some(OperationSnapshot { operation, state })
    }

    /// Operations currently parked for human input.
    pub fn pending_interventions(&self) -> Vec<OperationSnapshot> {
        self.states
            .iter()
            .filter(|entry| entry.status == RuntimeStatus::WaitingForHuman)
            .filter_map(|entry| self.operation_status(entry.key()))
            .collect()
    }

    fn initial_context(state: &AgentState) -> Result<TurnContext, DriverError> {
        let last = state.messages.last().ok_or_else(|| {
            DriverError::Internal("agent state has no messages to start from".to_string())
        })?;
        Ok(TurnContext {
            phase: TurnPhase::UserInput {
                message: last.content.clone(),
            },
            session_id: state.operation_id.clone(),
        })
    }

    fn session_id(&self, operation_id: &str) -> String {
        self.registry
            .get(operation_id)
            .map(|op| stream_key(&op))
            .unwrap_or_else(|| operation_id.to_string())
    }

    fn save(&self, operation_id: &str, state: &AgentState) {
        self.states.insert(operation_id.to_string(), state.clone());
    }

    async fn run_loop(
        &self,
        operation_id: &str,
        mut state: AgentState,
        context: TurnContext,
    ) -> Result<AgentState, DriverError> {
        let operation = self
            .registry
            .get(operation_id)
            .ok_or_else(|| DriverError::StateNotFound(operation_id.to_string()))?;
        let event_key = stream_key(&operation);
        let cancel = operation.cancellation.clone();
        let started = Instant::now();

        let mut context = Some(TurnContext {
            session_id: event_key.clone(),
            ..context
        });

        loop {
            // Cancellation is checked before every step; a cancelled run
            // stops emitting events entirely.
            if cancel.is_cancelled() {
                debug!(operation_id, "run cancelled, stopping loop");
                self.save(operation_id, &state);
                return Ok(state);
            }

            if !state.can_continue() {
                break;
            }
            let Some(step_context) = context.take() else {
                break;
            };

            let step_index = state.step_count;
            self.publish(&event_key, operation_id, step_index, StreamPayload::StepStart {
                data: StepStartData::default(),
            })
            .await;

            match self
                .runtime
                .step(&event_key, &state, step_context, &cancel)
                .await
            {
                Ok(output) => {
                    state = output.new_state;
                    context = output.next_context;
                    self.save(operation_id, &state);
                    self.registry.update_metadata(
                        operation_id,
                        MetadataPatch {
                            step_count: Some(state.step_count),
                            ..Default::default()
                        },
                    );

                    let next_step_scheduled = context.is_some() && state.can_continue();
                    self.publish(
                        &event_key,
                        operation_id,
                        step_index,
                        StreamPayload::StepComplete {
                            data: StepCompleteData {
                                next_step_scheduled: Some(next_step_scheduled),
                                ..Default::default()
                            },
                        },
                    )
                    .await;
                }
                Err(DriverError::Cancelled) => {
                    debug!(operation_id, "step cancelled mid-flight");
                    self.save(operation_id, &state);
                    return Ok(state);
                }
                Err(e) => {
                    return Ok(self
                        .handle_step_error(operation_id, &event_key, state, step_index, e)
                        .await);
                }
            }
        }

        // A parked run keeps its stream open; no terminal event.
        if state.status == RuntimeStatus::WaitingForHuman {
            self.registry.update_metadata(
                operation_id,
                MetadataPatch {
                    needs_human_input: Some(true),
                    pending_approval: state
                        .pending_tools_calling
                        .as_ref()
                        .and_then(|calls| serde_json::to_value(calls).ok()),
                    ..Default::default()
                },
            );
            self.save(operation_id, &state);
            debug!(operation_id, "run paused for human input");
            return Ok(state);
        }

        let reason = if state.status == RuntimeStatus::Done {
            CompletionReason::Completed
        } else {
            state.status = RuntimeStatus::Done;
            CompletionReason::MaxSteps
        };
        self.save(operation_id, &state);

        self.publish(
            &event_key,
            operation_id,
            state.step_count,
            StreamPayload::AgentRuntimeEnd {
                data: AgentRuntimeEndData {
                    status: Some("completed".to_string()),
                    reason: Some(reason),
                    reason_detail: None,
                    total_steps: Some(state.step_count),
                    execution_time_ms: Some(started.elapsed().as_millis() as u64),
                    final_state: serde_json::to_value(&state).ok(),
                },
            },
        )
        .await;

        self.registry.complete_operation(operation_id);
        self.registry.update_metadata(
            operation_id,
            MetadataPatch {
                final_status: Some("completed".to_string()),
                ..Default::default()
            },
        );
        debug!(operation_id, steps = state.step_count, "run completed");
        Ok(state)
    }

    /// Convert a step failure into exactly one `error` event, one
    /// `fail_operation` call, and a terminal `agent_runtime_end`.
    async fn handle_step_error(
        &self,
        operation_id: &str,
        event_key: &str,
        mut state: AgentState,
        step_index: u32,
        error: DriverError,
    ) -> AgentState {
        let phase = match &error {
            DriverError::Provider(_) => "model_generation",
            DriverError::ToolNotFound(_) | DriverError::ToolFailed { .. } => "tool_execution",
            _ => "step_execution",
        };
        warn!(operation_id, phase, error = %error, "step failed");

        let failure = error.to_failure();

        self.publish(
            event_key,
            operation_id,
            step_index,
            StreamPayload::Error {
                data: ErrorData {
                    error: error.to_string(),
                    message: Some(failure.message.clone()),
                    phase: Some(phase.to_string()),
                },
            },
        )
        .await;

        self.registry.fail_operation(operation_id, failure.clone());

        state.status = RuntimeStatus::Error;
        state.error = Some(failure);
        self.save(operation_id, &state);

        self.publish(
            event_key,
            operation_id,
            step_index,
            StreamPayload::AgentRuntimeEnd {
                data: AgentRuntimeEndData {
                    status: Some("error".to_string()),
                    reason: Some(CompletionReason::Error),
                    reason_detail: Some(error.to_string()),
                    total_steps: Some(state.step_count),
                    execution_time_ms: None,
                    final_state: serde_json::to_value(&state).ok(),
                },
            },
        )
        .await;

        state
    }

    /// Best-effort event publication: once a run is underway, a log failure
    /// must not abort the state machine.
    async fn publish(
        &self,
        event_key: &str,
        operation_id: &str,
        step_index: u32,
        payload: StreamPayload,
    ) {
        if let Err(e) = self
            .event_log
            .append(
                event_key,
                NewStreamEvent::new(operation_id.to_string(), payload).with_step(step_index),
            )
            .await
        {
            warn!(operation_id, error = %e, "event publication failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use colloquy_types::event::{StepPhase, StreamEvent};
    use colloquy_types::message::ToolCallPayload;
    use colloquy_types::operation::OperationStatus;
    use colloquy_types::provider::{GenerateChunk, GenerateRequest, ProviderError};

    use crate::driver::planner::ChatTurnPlanner;
    use crate::driver::provider::GenerateStream;
    use crate::driver::store::InMemoryMessageStore;
    use crate::driver::tools::FnToolExecutor;
    use crate::event::InMemoryEventLog;

    /// Provider that plays back one pre-scripted stream per call.
    struct ScriptedProvider {
        scripts: Mutex<VecDeque<Vec<Result<GenerateChunk, ProviderError>>>>,
    }

    impl ScriptedProvider {
        fn new(scripts: Vec<Vec<Result<GenerateChunk, ProviderError>>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
            }
        }
    }

    impl GenerateProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn stream(&self, _request: GenerateRequest) -> GenerateStream {
            let chunks = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| vec![Ok(GenerateChunk::Done)]);
            Box::pin(futures_util::stream::iter(chunks))
        }
    }

    type TestDriver =
        ExecutionDriver<InMemoryEventLog, InMemoryMessageStore, FnToolExecutor, ChatTurnPlanner>;

    struct Fixture {
        driver: TestDriver,
        registry: Arc<OperationRegistry>,
        event_log: Arc<InMemoryEventLog>,
    }

    fn fixture(
        planner: ChatTurnPlanner,
        tools: FnToolExecutor,
        scripts: Vec<Vec<Result<GenerateChunk, ProviderError>>>,
    ) -> Fixture {
        let registry = Arc::new(OperationRegistry::new());
        let event_log = Arc::new(InMemoryEventLog::new());
        let driver = ExecutionDriver::new(
            registry.clone(),
            event_log.clone(),
            Arc::new(InMemoryMessageStore::new()),
            Arc::new(tools),
            Arc::new(planner),
            Arc::new(ScriptedProvider::new(scripts)),
        );
        Fixture {
            driver,
            registry,
            event_log,
        }
    }

    fn params(session_id: &str) -> CreateOperationParams {
        CreateOperationParams {
            session_id: session_id.to_string(),
            topic_id: None,
            agent_id: Some("agent-1".to_string()),
            user_id: Some("user-1".to_string()),
            user_message: "hello".to_string(),
            placeholder_message_id: None,
            max_steps: None,
        }
    }

    async fn chronological(log: &InMemoryEventLog, key: &str) -> Vec<StreamEvent> {
        let mut events = log.history(key, 500).await.unwrap();
        events.reverse();
        events
    }

    fn event_types(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.event_type()).collect()
    }

    fn tool_call() -> ToolCallPayload {
        ToolCallPayload {
            id: "call-1".to_string(),
            identifier: "math".to_string(),
            api_name: "double".to_string(),
            arguments: "21".to_string(),
        }
    }

    #[tokio::test]
    async fn plain_chat_run_emits_full_lifecycle() {
        let fx = fixture(
            ChatTurnPlanner::new("sonnet"),
            FnToolExecutor::new(),
            vec![vec![
                Ok(GenerateChunk::Text("Hel".to_string())),
                Ok(GenerateChunk::Text("lo".to_string())),
                Ok(GenerateChunk::Done),
            ]],
        );

        let handle = fx.driver.create_operation(params("sess-1")).await.unwrap();
        let state = fx
            .driver
            .run_to_completion(&handle.operation_id)
            .await
            .unwrap();

        assert_eq!(state.status, RuntimeStatus::Done);
        assert_eq!(
            fx.registry.get(&handle.operation_id).unwrap().status,
            OperationStatus::Completed
        );

        let events = chronological(&fx.event_log, "sess-1").await;
        let types = event_types(&events);
        assert_eq!(types.first(), Some(&"agent_runtime_init"));
        assert_eq!(types.last(), Some(&"agent_runtime_end"));
        assert!(types.contains(&"stream_start"));
        assert_eq!(types.iter().filter(|t| **t == "stream_chunk").count(), 2);
        assert!(types.contains(&"stream_end"));
        // Timestamps strictly increase across the whole run.
        assert!(events.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn provider_error_emits_single_error_event_and_fails_operation() {
        let fx = fixture(
            ChatTurnPlanner::new("sonnet"),
            FnToolExecutor::new(),
            vec![vec![
                Ok(GenerateChunk::Text("par".to_string())),
                Err(ProviderError::Stream("connection reset".to_string())),
            ]],
        );

        let handle = fx.driver.create_operation(params("sess-1")).await.unwrap();
        let state = fx
            .driver
            .run_to_completion(&handle.operation_id)
            .await
            .unwrap();

        assert_eq!(state.status, RuntimeStatus::Error);

        let operation = fx.registry.get(&handle.operation_id).unwrap();
        assert_eq!(operation.status, OperationStatus::Failed);
        assert_eq!(
            operation.metadata.error.as_ref().unwrap().kind,
            FailureKind::AgentExecution
        );

        let events = chronological(&fx.event_log, "sess-1").await;
        let error_events: Vec<_> = events
            .iter()
            .filter(|e| matches!(e.payload, StreamPayload::Error { .. }))
            .collect();
        assert_eq!(error_events.len(), 1);
        match &error_events[0].payload {
            StreamPayload::Error { data } => {
                assert_eq!(data.phase.as_deref(), Some("model_generation"));
            }
            _ => unreachable!(),
        }
        // The stream still terminates so the transport can close.
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn approval_gate_pauses_then_resume_completes() {
        let fx = fixture(
            ChatTurnPlanner::new("sonnet").with_approval_gate(true),
            FnToolExecutor::new().register("math", "double", |args| {
                let n: i64 = args.parse().map_err(|_| "bad".to_string())?;
                Ok((n * 2).to_string())
            }),
            vec![
                vec![
                    Ok(GenerateChunk::ToolCalls(vec![tool_call()])),
                    Ok(GenerateChunk::Done),
                ],
                vec![
                    Ok(GenerateChunk::Text("the answer is 42".to_string())),
                    Ok(GenerateChunk::Done),
                ],
            ],
        );

        let handle = fx.driver.create_operation(params("sess-1")).await.unwrap();
        let state = fx
            .driver
            .run_to_completion(&handle.operation_id)
            .await
            .unwrap();

        // Parked: no terminal event, metadata flags set.
        assert_eq!(state.status, RuntimeStatus::WaitingForHuman);
        let operation = fx.registry.get(&handle.operation_id).unwrap();
        assert_eq!(operation.metadata.needs_human_input, Some(true));
        assert!(operation.metadata.pending_approval.is_some());

        let events = chronological(&fx.event_log, "sess-1").await;
        assert!(!events.iter().any(|e| e.is_terminal()));
        let approval = events
            .iter()
            .find_map(|e| match &e.payload {
                StreamPayload::StepStart { data }
                    if data.phase == Some(StepPhase::HumanApproval) =>
                {
                    Some(data.clone())
                }
                _ => None,
            })
            .expect("human approval step_start");
        assert!(approval.requires_approval);

        // Approve and finish.
        let state = fx
            .driver
            .resume_with_intervention(
                &handle.operation_id,
                HumanIntervention::Approve {
                    tool_call_id: "call-1".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(state.status, RuntimeStatus::Done);
        assert_eq!(
            fx.registry.get(&handle.operation_id).unwrap().status,
            OperationStatus::Completed
        );

        let events = chronological(&fx.event_log, "sess-1").await;
        let types = event_types(&events);
        assert!(
            types
                .iter()
                .any(|t| *t == "step_complete"),
        );
        assert!(events.last().unwrap().is_terminal());

        // Tool actually ran: its completion carries the result.
        let tool_complete = events.iter().find_map(|e| match &e.payload {
            StreamPayload::StepComplete { data }
                if data.phase == Some(StepPhase::ToolExecution) =>
            {
                data.result.clone()
            }
            _ => None,
        });
        assert_eq!(tool_complete.unwrap()["content"], "42");
    }

    #[tokio::test]
    async fn resume_requires_waiting_state() {
        let fx = fixture(
            ChatTurnPlanner::new("sonnet"),
            FnToolExecutor::new(),
            vec![vec![Ok(GenerateChunk::Done)]],
        );
        let handle = fx.driver.create_operation(params("sess-1")).await.unwrap();

        let result = fx
            .driver
            .resume_with_intervention(
                &handle.operation_id,
                HumanIntervention::Input {
                    content: "hi".to_string(),
                },
            )
            .await;
        assert!(matches!(result, Err(DriverError::NotWaitingForHuman(_))));
    }

    #[tokio::test]
    async fn cancelled_operation_stops_emitting() {
        let fx = fixture(
            ChatTurnPlanner::new("sonnet"),
            FnToolExecutor::new(),
            vec![vec![
                Ok(GenerateChunk::Text("never delivered".to_string())),
                Ok(GenerateChunk::Done),
            ]],
        );

        let handle = fx.driver.create_operation(params("sess-1")).await.unwrap();
        fx.registry
            .cancel_operation(&handle.operation_id, "user cancelled");

        let before = fx.event_log.event_count("sess-1");
        fx.driver
            .run_to_completion(&handle.operation_id)
            .await
            .unwrap();

        // No further events after cancellation, and no terminal frame.
        assert_eq!(fx.event_log.event_count("sess-1"), before);
        assert_eq!(
            fx.registry.get(&handle.operation_id).unwrap().status,
            OperationStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn max_steps_forces_completion() {
        let fx = fixture(
            ChatTurnPlanner::new("sonnet"),
            FnToolExecutor::new(),
            vec![vec![
                Ok(GenerateChunk::Text("looping".to_string())),
                Ok(GenerateChunk::Done),
            ]],
        );

        let mut p = params("sess-1");
        p.max_steps = Some(1);
        let handle = fx.driver.create_operation(p).await.unwrap();
        let state = fx
            .driver
            .run_to_completion(&handle.operation_id)
            .await
            .unwrap();

        assert_eq!(state.status, RuntimeStatus::Done);
        assert_eq!(state.step_count, 1);

        let events = chronological(&fx.event_log, "sess-1").await;
        match &events.last().unwrap().payload {
            StreamPayload::AgentRuntimeEnd { data } => {
                assert_eq!(data.reason, Some(CompletionReason::MaxSteps));
            }
            other => panic!("expected terminal event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn operation_status_snapshot_and_pending_interventions() {
        let fx = fixture(
            ChatTurnPlanner::new("sonnet").with_approval_gate(true),
            FnToolExecutor::new(),
            vec![vec![
                Ok(GenerateChunk::ToolCalls(vec![tool_call()])),
                Ok(GenerateChunk::Done),
            ]],
        );

        let handle = fx.driver.create_operation(params("sess-1")).await.unwrap();
        fx.driver
            .run_to_completion(&handle.operation_id)
            .await
            .unwrap();

        let snapshot = fx.driver.operation_status(&handle.operation_id).unwrap();
        assert_eq!(snapshot.state.status, RuntimeStatus::WaitingForHuman);

        let pending = fx.driver.pending_interventions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation.id, handle.operation_id);
    }
}
