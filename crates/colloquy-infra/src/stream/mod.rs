//! Client-side stream transport.

mod client;

pub use client::{StreamClient, StreamClientError, StreamClientOptions, StreamKey};
