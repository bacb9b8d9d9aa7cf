//! Client-side stream consumption.

mod state;

pub use state::{ConversationState, OperationProgress};
