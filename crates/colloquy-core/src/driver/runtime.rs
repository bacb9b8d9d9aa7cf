//! Instruction execution against agent state.
//!
//! `AgentRuntime` is the engine half of the plan/execute loop: it runs the
//! planner's instructions, streams model output, executes tools, and
//! publishes the corresponding stream events. It never decides policy and it
//! never finalizes the owning operation -- that is the `ExecutionDriver`'s
//! job.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use colloquy_types::agent::{
    AgentInstruction, AgentState, RuntimeStatus, TurnContext, TurnPhase,
};
use colloquy_types::error::DriverError;
use colloquy_types::event::{
    NewStreamEvent, StepCompleteData, StepPhase, StepStartData, StreamChunkData, StreamEndData,
    StreamPayload, StreamStartData,
};
use colloquy_types::message::{MessagePatch, MessageRole, NewMessage, ToolCallPayload};
use colloquy_types::provider::{GenerateChunk, GenerateMessage, GenerateRequest};

use super::planner::TurnPlanner;
use super::provider::GenerateProvider;
use super::store::MessageStore;
use super::tools::{ToolExecutor, ToolExecutionResult};
use crate::event::EventLog;

/// Result of executing one step's worth of instructions.
#[derive(Debug)]
pub struct StepOutput {
    pub new_state: AgentState,
    /// Context for the next step; `None` means the loop is finished or
    /// parked.
    pub next_context: Option<TurnContext>,
}

/// Executes instructions and translates provider output into stream events.
pub struct AgentRuntime<E, S, T, P>
where
    E: EventLog,
    S: MessageStore,
    T: ToolExecutor,
    P: TurnPlanner,
{
    event_log: Arc<E>,
    message_store: Arc<S>,
    tools: Arc<T>,
    planner: Arc<P>,
    provider: Arc<dyn GenerateProvider>,
}

impl<E, S, T, P> AgentRuntime<E, S, T, P>
where
    E: EventLog,
    S: MessageStore,
    T: ToolExecutor,
    P: TurnPlanner,
{
    pub fn new(
        event_log: Arc<E>,
        message_store: Arc<S>,
        tools: Arc<T>,
        planner: Arc<P>,
        provider: Arc<dyn GenerateProvider>,
    ) -> Self {
        Self {
            event_log,
            message_store,
            tools,
            planner,
            provider,
        }
    }

    /// Execute one step: plan from the context, run every instruction,
    /// stopping early when the state parks for human input.
    pub async fn step(
        &self,
        event_key: &str,
        state: &AgentState,
        context: TurnContext,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, DriverError> {
        let mut new_state = state.clone();
        new_state.step_count += 1;
        new_state.status = RuntimeStatus::Running;
        new_state.touch();

        let step_index = state.step_count;
        let instructions = self.planner.plan(&context, &new_state).await?;
        debug!(
            operation_id = %new_state.operation_id,
            step_index,
            count = instructions.len(),
            "planned instructions"
        );

        let mut next_context: Option<TurnContext> = None;
        for instruction in instructions {
            let produced = match instruction {
                AgentInstruction::CallModel(request) => {
                    self.exec_call_model(
                        event_key,
                        &mut new_state,
                        &context.session_id,
                        request,
                        step_index,
                        cancel,
                    )
                    .await?
                }
                AgentInstruction::CallTool(call) => {
                    self.exec_call_tool(
                        event_key,
                        &mut new_state,
                        &context.session_id,
                        call,
                        step_index,
                    )
                    .await?
                }
                AgentInstruction::RequestApproval(calls) => {
                    self.exec_request_approval(event_key, &mut new_state, calls, step_index)
                        .await?
                }
                AgentInstruction::Finish { reason, detail } => {
                    self.exec_finish(event_key, &mut new_state, reason, detail, step_index)
                        .await?
                }
            };

            if let Some(produced) = produced {
                next_context = Some(produced);
            }

            if new_state.status == RuntimeStatus::WaitingForHuman {
                next_context = None;
                break;
            }
            if new_state.status == RuntimeStatus::Done {
                next_context = None;
                break;
            }
        }

        new_state.touch();
        Ok(StepOutput {
            new_state,
            next_context,
        })
    }

    /// Stream a model generation, publishing `stream_start` / `stream_chunk`
    /// / `stream_end` and materializing the assistant message.
    async fn exec_call_model(
        &self,
        event_key: &str,
        state: &mut AgentState,
        session_id: &str,
        request: GenerateRequest,
        step_index: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<TurnContext>, DriverError> {
        let assistant_message = self
            .message_store
            .create_message(NewMessage {
                role: MessageRole::Assistant,
                content: String::new(),
                session_id: session_id.to_string(),
                topic_id: None,
                tool_call_id: None,
            })
            .await?;

        self.publish(
            event_key,
            state,
            step_index,
            StreamPayload::StreamStart {
                data: StreamStartData {
                    assistant_message: assistant_message.clone(),
                    model: Some(request.model.clone()),
                    provider: Some(self.provider.name().to_string()),
                },
            },
        )
        .await?;

        let mut content = String::new();
        let mut reasoning = String::new();
        let mut tool_calls: Vec<ToolCallPayload> = Vec::new();

        let mut stream = self.provider.stream(request);
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                debug!(operation_id = %state.operation_id, "generation cancelled mid-stream");
                return Err(DriverError::Cancelled);
            }

            match chunk? {
                GenerateChunk::Text(delta) => {
                    content.push_str(&delta);
                    self.publish(
                        event_key,
                        state,
                        step_index,
                        StreamPayload::StreamChunk {
                            data: StreamChunkData::Text { content: delta },
                        },
                    )
                    .await?;
                }
                GenerateChunk::Reasoning(delta) => {
                    reasoning.push_str(&delta);
                    self.publish(
                        event_key,
                        state,
                        step_index,
                        StreamPayload::StreamChunk {
                            data: StreamChunkData::Reasoning { reasoning: delta },
                        },
                    )
                    .await?;
                }
                GenerateChunk::ToolCalls(calls) => {
                    tool_calls = calls.clone();
                    self.publish(
                        event_key,
                        state,
                        step_index,
                        StreamPayload::StreamChunk {
                            data: StreamChunkData::ToolsCalling {
                                tools_calling: calls,
                            },
                        },
                    )
                    .await?;
                }
                GenerateChunk::Done => break,
            }
        }

        self.publish(
            event_key,
            state,
            step_index,
            StreamPayload::StreamEnd {
                data: StreamEndData {
                    final_content: Some(content.clone()),
                    reasoning: if reasoning.is_empty() {
                        None
                    } else {
                        Some(reasoning.clone())
                    },
                    tool_calls: tool_calls.clone(),
                    image_list: None,
                    grounding: None,
                },
            },
        )
        .await?;

        self.message_store
            .update_message(
                &assistant_message.id,
                MessagePatch {
                    content: Some(content.clone()),
                    reasoning: if reasoning.is_empty() {
                        None
                    } else {
                        Some(reasoning)
                    },
                    tools: Some(tool_calls.clone()),
                    error: None,
                },
            )
            .await?;

        state.messages.push(GenerateMessage {
            role: MessageRole::Assistant,
            content: content.clone(),
        });

        Ok(Some(TurnContext {
            phase: TurnPhase::ModelResult {
                content,
                tool_calls,
            },
            session_id: session_id.to_string(),
        }))
    }

    /// Execute one tool call, bracketed by `step_start` / `step_complete`
    /// with phase `tool_execution`.
    async fn exec_call_tool(
        &self,
        event_key: &str,
        state: &mut AgentState,
        session_id: &str,
        call: ToolCallPayload,
        step_index: u32,
    ) -> Result<Option<TurnContext>, DriverError> {
        self.publish(
            event_key,
            state,
            step_index,
            StreamPayload::StepStart {
                data: StepStartData {
                    phase: Some(StepPhase::ToolExecution),
                    tool_call: Some(call.clone()),
                    ..Default::default()
                },
            },
        )
        .await?;

        let result: ToolExecutionResult = self.tools.execute(&call).await?;

        self.publish(
            event_key,
            state,
            step_index,
            StreamPayload::StepComplete {
                data: StepCompleteData {
                    phase: Some(StepPhase::ToolExecution),
                    result: Some(serde_json::json!({
                        "content": result.content,
                        "isSuccess": result.is_success,
                    })),
                    execution_time_ms: Some(result.execution_time_ms),
                    ..Default::default()
                },
            },
        )
        .await?;

        self.message_store
            .create_message(NewMessage {
                role: MessageRole::Tool,
                content: result.content.clone(),
                session_id: session_id.to_string(),
                topic_id: None,
                tool_call_id: Some(call.id.clone()),
            })
            .await?;

        state.messages.push(GenerateMessage {
            role: MessageRole::Tool,
            content: result.content.clone(),
        });

        Ok(Some(TurnContext {
            phase: TurnPhase::ToolResult {
                tool_call_id: call.id,
                content: result.content,
                is_success: result.is_success,
            },
            session_id: session_id.to_string(),
        }))
    }

    /// Park the run until a human approves or rejects.
    async fn exec_request_approval(
        &self,
        event_key: &str,
        state: &mut AgentState,
        calls: Vec<ToolCallPayload>,
        step_index: u32,
    ) -> Result<Option<TurnContext>, DriverError> {
        self.publish(
            event_key,
            state,
            step_index,
            StreamPayload::StepStart {
                data: StepStartData {
                    phase: Some(StepPhase::HumanApproval),
                    requires_approval: true,
                    pending_tools_calling: Some(calls.clone()),
                    tool_call: None,
                },
            },
        )
        .await?;

        state.status = RuntimeStatus::WaitingForHuman;
        state.pending_tools_calling = Some(calls);
        Ok(None)
    }

    /// Finish the run: `step_complete` with phase `execution_complete`.
    async fn exec_finish(
        &self,
        event_key: &str,
        state: &mut AgentState,
        reason: colloquy_types::agent::CompletionReason,
        detail: Option<String>,
        step_index: u32,
    ) -> Result<Option<TurnContext>, DriverError> {
        state.status = RuntimeStatus::Done;

        self.publish(
            event_key,
            state,
            step_index,
            StreamPayload::StepComplete {
                data: StepCompleteData {
                    phase: Some(StepPhase::ExecutionComplete),
                    final_state: Some(serde_json::to_value(&*state).map_err(|e| {
                        DriverError::Internal(format!("final state serialization: {e}"))
                    })?),
                    result: detail.map(serde_json::Value::String),
                    ..Default::default()
                },
            },
        )
        .await?;

        debug!(operation_id = %state.operation_id, ?reason, "run finished");
        Ok(None)
    }

    async fn publish(
        &self,
        event_key: &str,
        state: &AgentState,
        step_index: u32,
        payload: StreamPayload,
    ) -> Result<(), DriverError> {
        self.event_log
            .append(
                event_key,
                NewStreamEvent::new(state.operation_id.clone(), payload).with_step(step_index),
            )
            .await?;
        Ok(())
    }
}
