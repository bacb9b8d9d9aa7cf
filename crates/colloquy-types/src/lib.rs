//! Shared domain types for Colloquy.
//!
//! This crate contains the core domain types used across the Colloquy runtime:
//! operations, stream events, orchestration state, agent execution state,
//! conversation messages, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror,
//! and tokio-util (for the `CancellationToken` every operation carries).

pub mod agent;
pub mod error;
pub mod event;
pub mod message;
pub mod operation;
pub mod orchestration;
pub mod provider;
