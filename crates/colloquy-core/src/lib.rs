//! Colloquy runtime core.
//!
//! The four components of the agent runtime orchestration and event
//! streaming core:
//!
//! - [`operation`] -- the operation lifecycle registry (start / cancel /
//!   complete / fail, cascading cancellation, message association)
//! - [`event`] -- the append-only per-session event log with history and
//!   live subscription from a cursor
//! - [`driver`] -- the agent execution driver translating provider output
//!   into stream events, with tool execution and human-approval gating
//! - [`group`] -- the bounded, supervisor-directed group orchestration
//!   state machine
//!
//! [`consumer`] is the client side: a pure reducer that applies stream
//! frames to local conversation state.
//!
//! Persistence and model inference are consumed through narrow traits
//! (`MessageStore`, `GenerateProvider`, `EventLog`); implementations live in
//! colloquy-infra or the embedding application.

pub mod consumer;
pub mod driver;
pub mod event;
pub mod group;
pub mod operation;
