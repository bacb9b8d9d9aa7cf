//! Turn planning: deciding what the runtime executes next.
//!
//! The planner is the agent "brain"; the runtime is the engine. Keeping the
//! policy behind a trait lets group orchestration plug in differently
//! prompted agents without touching the execution machinery.

use colloquy_types::agent::{AgentInstruction, AgentState, CompletionReason, TurnContext, TurnPhase};
use colloquy_types::error::DriverError;
use colloquy_types::provider::{GenerateMessage, GenerateRequest};

/// Produces the next instructions for a step. Uses native async fn in traits
/// (RPITIT, Rust 2024 edition).
pub trait TurnPlanner: Send + Sync {
    fn plan(
        &self,
        context: &TurnContext,
        state: &AgentState,
    ) -> impl std::future::Future<Output = Result<Vec<AgentInstruction>, DriverError>> + Send;
}

/// Default general-chat policy:
///
/// - user input -> call the model over the accumulated transcript
/// - model result with tool calls -> request approval when gating is on,
///   otherwise execute the calls
/// - model result without tool calls -> finish
/// - tool result -> call the model again with the tool output in context
/// - approved tool -> execute it
#[derive(Debug, Clone)]
pub struct ChatTurnPlanner {
    pub model: String,
    /// Tool manifests offered to the model.
    pub tools: Vec<serde_json::Value>,
    /// When true, every tool call pauses for human approval.
    pub approval_gate: bool,
}

impl ChatTurnPlanner {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            tools: Vec::new(),
            approval_gate: false,
        }
    }

    pub fn with_tools(mut self, tools: Vec<serde_json::Value>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_approval_gate(mut self, approval_gate: bool) -> Self {
        self.approval_gate = approval_gate;
        self
    }

    fn request_from(&self, messages: &[GenerateMessage]) -> GenerateRequest {
        GenerateRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            tools: self.tools.clone(),
        }
    }
}

impl TurnPlanner for ChatTurnPlanner {
    async fn plan(
        &self,
        context: &TurnContext,
        state: &AgentState,
    ) -> Result<Vec<AgentInstruction>, DriverError> {
        let instructions = match &context.phase {
            TurnPhase::UserInput { .. } | TurnPhase::ToolResult { .. } => {
                vec![AgentInstruction::CallModel(self.request_from(&state.messages))]
            }

            TurnPhase::ModelResult { tool_calls, .. } => {
                if tool_calls.is_empty() {
                    vec![AgentInstruction::Finish {
                        reason: CompletionReason::Completed,
                        detail: None,
                    }]
                } else if self.approval_gate {
                    vec![AgentInstruction::RequestApproval(tool_calls.clone())]
                } else {
                    tool_calls
                        .iter()
                        .cloned()
                        .map(AgentInstruction::CallTool)
                        .collect()
                }
            }

            TurnPhase::ApprovedTool { tool_call } => {
                vec![AgentInstruction::CallTool(tool_call.clone())]
            }
        };

        Ok(instructions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_types::message::ToolCallPayload;

    fn state() -> AgentState {
        AgentState::new("op-1", Some(10))
    }

    fn context(phase: TurnPhase) -> TurnContext {
        TurnContext {
            phase,
            session_id: "sess-1".to_string(),
        }
    }

    fn tool_call() -> ToolCallPayload {
        ToolCallPayload {
            id: "call-1".to_string(),
            identifier: "web".to_string(),
            api_name: "search".to_string(),
            arguments: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn user_input_plans_model_call() {
        let planner = ChatTurnPlanner::new("sonnet");
        let plan = planner
            .plan(
                &context(TurnPhase::UserInput {
                    message: "hi".to_string(),
                }),
                &state(),
            )
            .await
            .unwrap();
        assert!(matches!(plan.as_slice(), [AgentInstruction::CallModel(_)]));
    }

    #[tokio::test]
    async fn model_result_without_tools_finishes() {
        let planner = ChatTurnPlanner::new("sonnet");
        let plan = planner
            .plan(
                &context(TurnPhase::ModelResult {
                    content: "answer".to_string(),
                    tool_calls: vec![],
                }),
                &state(),
            )
            .await
            .unwrap();
        assert!(matches!(
            plan.as_slice(),
            [AgentInstruction::Finish {
                reason: CompletionReason::Completed,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn tool_calls_are_gated_when_approval_is_on() {
        let planner = ChatTurnPlanner::new("sonnet").with_approval_gate(true);
        let plan = planner
            .plan(
                &context(TurnPhase::ModelResult {
                    content: String::new(),
                    tool_calls: vec![tool_call()],
                }),
                &state(),
            )
            .await
            .unwrap();
        assert!(matches!(plan.as_slice(), [AgentInstruction::RequestApproval(calls)] if calls.len() == 1));
    }

    #[tokio::test]
    async fn tool_calls_execute_directly_without_gate() {
        let planner = ChatTurnPlanner::new("sonnet");
        let plan = planner
            .plan(
                &context(TurnPhase::ModelResult {
                    content: String::new(),
                    tool_calls: vec![tool_call(), tool_call()],
                }),
                &state(),
            )
            .await
            .unwrap();
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|i| matches!(i, AgentInstruction::CallTool(_))));
    }

    #[tokio::test]
    async fn approved_tool_executes() {
        let planner = ChatTurnPlanner::new("sonnet").with_approval_gate(true);
        let plan = planner
            .plan(
                &context(TurnPhase::ApprovedTool {
                    tool_call: tool_call(),
                }),
                &state(),
            )
            .await
            .unwrap();
        assert!(matches!(plan.as_slice(), [AgentInstruction::CallTool(_)]));
    }
}
