//! MessageStore trait definition.
//!
//! Narrow persistence seam for conversation messages. The runtime
//! materializes assistant messages through it and patches them as streaming
//! progresses; durable storage is an external collaborator. Uses native
//! async fn in traits (RPITIT, Rust 2024 edition).

use std::sync::Arc;

use dashmap::DashMap;

use colloquy_types::error::DriverError;
use colloquy_types::message::{ConversationMessage, MessagePatch, NewMessage};

/// Message persistence boundary.
pub trait MessageStore: Send + Sync {
    /// Create a message, returning it with its assigned id.
    fn create_message(
        &self,
        new: NewMessage,
    ) -> impl std::future::Future<Output = Result<ConversationMessage, DriverError>> + Send;

    /// Apply a partial update to a message.
    fn update_message(
        &self,
        id: &str,
        patch: MessagePatch,
    ) -> impl std::future::Future<Output = Result<(), DriverError>> + Send;

    fn get_message(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<ConversationMessage>, DriverError>> + Send;

    /// Remove a message (used to drop optimistic placeholders after a failed
    /// start).
    fn delete_message(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<(), DriverError>> + Send;
}

/// Dashmap-backed store for tests and single-process deployments. Cloning
/// shares the underlying map.
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    messages: Arc<DashMap<String, ConversationMessage>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages for a session, oldest first.
    pub fn session_messages(&self, session_id: &str) -> Vec<ConversationMessage> {
        let mut messages: Vec<ConversationMessage> = self
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .map(|m| m.clone())
            .collect();
        messages.sort_by_key(|m| m.created_at);
        messages
    }
}

impl MessageStore for InMemoryMessageStore {
    async fn create_message(&self, new: NewMessage) -> Result<ConversationMessage, DriverError> {
        let message = new.into_message();
        self.messages.insert(message.id.clone(), message.clone());
        Ok(message)
    }

    async fn update_message(&self, id: &str, patch: MessagePatch) -> Result<(), DriverError> {
        let Some(mut message) = self.messages.get_mut(id) else {
            return Err(DriverError::MessageStore(format!("message not found: {id}")));
        };
        if let Some(content) = patch.content {
            message.content = content;
        }
        if let Some(reasoning) = patch.reasoning {
            message.reasoning = Some(reasoning);
        }
        if let Some(tools) = patch.tools {
            message.tools = tools;
        }
        if let Some(error) = patch.error {
            message.error = Some(error);
        }
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<ConversationMessage>, DriverError> {
        Ok(self.messages.get(id).map(|m| m.clone()))
    }

    async fn delete_message(&self, id: &str) -> Result<(), DriverError> {
        self.messages.remove(id);
        Ok(())
    }
}
