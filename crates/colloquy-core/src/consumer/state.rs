//! Local conversation state driven by stream frames.
//!
//! A pure reducer: the reconnecting client feeds it frames and it mutates
//! the mirrored conversation -- materializing the assistant message,
//! accumulating deltas, tracking loading and human-approval flags, and
//! recording the last seen event id for resume.

use std::collections::HashMap;

use tracing::debug;

use colloquy_types::error::{FailureKind, OperationFailure};
use colloquy_types::event::wire::{Frame, WireFrame};
use colloquy_types::event::{
    StepPhase, StreamChunkData, StreamEvent, StreamPayload,
};
use colloquy_types::message::{ConversationMessage, ToolCallPayload};

/// Per-operation progress mirrored from the stream.
#[derive(Debug, Clone, Default)]
pub struct OperationProgress {
    pub status: String,
    pub last_event_id: String,
    pub step_count: u32,
    pub needs_human_input: bool,
    pub pending_approval: Option<Vec<ToolCallPayload>>,
    pub error: Option<String>,
}

/// Streaming accumulator for one operation's assistant message.
#[derive(Debug, Clone, Default)]
struct Accumulator {
    assistant_id: Option<String>,
    placeholder_id: Option<String>,
    content: String,
    reasoning: String,
}

/// Mirror of the conversation as seen through the event stream.
#[derive(Debug, Default)]
pub struct ConversationState {
    messages: Vec<ConversationMessage>,
    loading: HashMap<String, bool>,
    operations: HashMap<String, OperationProgress>,
    accumulators: HashMap<String, Accumulator>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation with an optimistic placeholder message; the
    /// placeholder is dropped when `stream_start` delivers the real one.
    pub fn begin_operation(&mut self, operation_id: &str, placeholder: ConversationMessage) {
        self.loading.insert(placeholder.id.clone(), true);
        self.accumulators.insert(
            operation_id.to_string(),
            Accumulator {
                placeholder_id: Some(placeholder.id.clone()),
                ..Default::default()
            },
        );
        self.operations.insert(
            operation_id.to_string(),
            OperationProgress {
                status: "created".to_string(),
                last_event_id: "0".to_string(),
                ..Default::default()
            },
        );
        self.messages.push(placeholder);
    }

    /// Apply one inbound frame.
    pub fn apply(&mut self, frame: &Frame) {
        match frame {
            Frame::Wire(WireFrame::Connected { .. }) | Frame::Wire(WireFrame::Heartbeat { .. }) => {}
            Frame::Wire(WireFrame::Error { error, .. }) => {
                debug!(error, "transport error frame");
                for progress in self.operations.values_mut() {
                    if progress.error.is_none() && !Self::is_settled(progress) {
                        progress.error = Some(error.clone());
                    }
                }
            }
            Frame::Event(event) => self.apply_event(event),
        }
    }

    /// Current messages, in arrival order.
    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn message(&self, id: &str) -> Option<&ConversationMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn is_loading(&self, message_id: &str) -> bool {
        self.loading.get(message_id).copied().unwrap_or(false)
    }

    pub fn operation(&self, operation_id: &str) -> Option<&OperationProgress> {
        self.operations.get(operation_id)
    }

    /// The resume cursor for an operation (max seen timestamp, as a string).
    pub fn last_event_id(&self, operation_id: &str) -> Option<&str> {
        self.operations
            .get(operation_id)
            .map(|p| p.last_event_id.as_str())
    }

    fn is_settled(progress: &OperationProgress) -> bool {
        matches!(progress.status.as_str(), "done" | "error" | "completed")
    }

    fn apply_event(&mut self, event: &StreamEvent) {
        let operation_id = event.operation_id.clone();
        {
            let progress = self.operations.entry(operation_id.clone()).or_default();
            progress.last_event_id = event.timestamp.to_string();
            if let Some(step_index) = event.step_index {
                progress.step_count = step_index;
            }
        }

        let target = self.target_message_id(&operation_id);

        match &event.payload {
            StreamPayload::AgentRuntimeInit { .. } => {
                self.progress_mut(&operation_id).status = "running".to_string();
            }

            StreamPayload::StreamStart { data } => {
                // The real assistant message replaces the optimistic
                // placeholder.
                let accumulator = self.accumulators.entry(operation_id.clone()).or_default();
                if let Some(placeholder) = accumulator.placeholder_id.take() {
                    self.loading.remove(&placeholder);
                    self.messages.retain(|m| m.id != placeholder);
                }
                accumulator.assistant_id = Some(data.assistant_message.id.clone());
                accumulator.content.clear();
                accumulator.reasoning.clear();
                self.loading.insert(data.assistant_message.id.clone(), true);
                self.messages.push(data.assistant_message.clone());
            }

            StreamPayload::StreamChunk { data } => {
                let accumulator = self.accumulators.entry(operation_id.clone()).or_default();
                match data {
                    StreamChunkData::Text { content } => {
                        accumulator.content.push_str(content);
                        let full = accumulator.content.clone();
                        if let Some(id) = accumulator.assistant_id.clone() {
                            self.patch_message(&id, |m| m.content = full);
                        }
                    }
                    StreamChunkData::Reasoning { reasoning } => {
                        accumulator.reasoning.push_str(reasoning);
                        let full = accumulator.reasoning.clone();
                        if let Some(id) = accumulator.assistant_id.clone() {
                            self.patch_message(&id, |m| m.reasoning = Some(full));
                        }
                    }
                    StreamChunkData::ToolsCalling { tools_calling } => {
                        let tools = tools_calling.clone();
                        if let Some(id) = accumulator.assistant_id.clone() {
                            self.patch_message(&id, |m| m.tools = tools);
                        }
                    }
                }
            }

            StreamPayload::StreamEnd { data } => {
                if let Some(id) = &target {
                    let data = data.clone();
                    self.patch_message(id, move |m| {
                        if let Some(content) = data.final_content {
                            m.content = content;
                        }
                        if data.reasoning.is_some() {
                            m.reasoning = data.reasoning;
                        }
                        if !data.tool_calls.is_empty() {
                            m.tools = data.tool_calls;
                        }
                    });
                    self.loading.insert(id.clone(), false);
                }
            }

            StreamPayload::StepStart { data } => {
                if data.phase == Some(StepPhase::HumanApproval) && data.requires_approval {
                    let progress = self.progress_mut(&operation_id);
                    progress.needs_human_input = true;
                    progress.pending_approval = data.pending_tools_calling.clone();
                    // Waiting on a human, not on the model.
                    if let Some(id) = &target {
                        self.loading.insert(id.clone(), false);
                    }
                }
            }

            StreamPayload::StepComplete { data } => {
                if data.phase == Some(StepPhase::ExecutionComplete) {
                    let progress = self.progress_mut(&operation_id);
                    if let Some(status) = data
                        .final_state
                        .as_ref()
                        .and_then(|s| s.get("status"))
                        .and_then(|s| s.as_str())
                    {
                        progress.status = status.to_string();
                    }
                    if let Some(id) = &target {
                        self.loading.insert(id.clone(), false);
                    }
                }
            }

            StreamPayload::Error { data } => {
                let message = data
                    .message
                    .clone()
                    .unwrap_or_else(|| data.error.clone());
                {
                    let progress = self.progress_mut(&operation_id);
                    progress.status = "error".to_string();
                    progress.error = Some(message.clone());
                }
                if let Some(id) = &target {
                    self.patch_message(id, move |m| {
                        m.error = Some(OperationFailure::new(FailureKind::Unknown, message));
                    });
                    self.loading.insert(id.clone(), false);
                }
            }

            StreamPayload::AgentRuntimeEnd { data } => {
                let progress = self.progress_mut(&operation_id);
                progress.status = data.status.clone().unwrap_or_else(|| "done".to_string());
                progress.needs_human_input = false;
                if let Some(id) = &target {
                    self.loading.insert(id.clone(), false);
                }
            }
        }
    }

    fn progress_mut(&mut self, operation_id: &str) -> &mut OperationProgress {
        self.operations.entry(operation_id.to_string()).or_default()
    }

    fn target_message_id(&self, operation_id: &str) -> Option<String> {
        self.accumulators.get(operation_id).and_then(|a| {
            a.assistant_id
                .clone()
                .or_else(|| a.placeholder_id.clone())
        })
    }

    fn patch_message<F: FnOnce(&mut ConversationMessage)>(&mut self, id: &str, patch: F) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            patch(message);
        }
    }
}
