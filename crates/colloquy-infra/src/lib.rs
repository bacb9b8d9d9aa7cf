//! Infrastructure implementations for Colloquy.
//!
//! - [`sqlite`] -- the durable, cross-process event log backing
//! - [`stream`] -- the reconnecting SSE stream client

pub mod sqlite;
pub mod stream;
