//! Request handlers.

pub mod operation;
pub mod orchestration;
pub mod stream;
