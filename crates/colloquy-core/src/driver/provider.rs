//! GenerateProvider trait definition.
//!
//! The narrow "generate" capability the driver consumes. Concrete adapters
//! (Anthropic, OpenAI, ...) live outside this workspace; tests use scripted
//! providers.

use std::pin::Pin;

use futures_util::Stream;

use colloquy_types::provider::{GenerateChunk, GenerateRequest, ProviderError};

/// Boxed chunk stream -- boxed (not RPITIT) so the trait stays object-safe
/// and the driver can hold `Arc<dyn GenerateProvider>`.
pub type GenerateStream =
    Pin<Box<dyn Stream<Item = Result<GenerateChunk, ProviderError>> + Send + 'static>>;

/// Streaming model generation boundary.
pub trait GenerateProvider: Send + Sync {
    /// Human-readable provider name (e.g. "anthropic").
    fn name(&self) -> &str;

    /// Start a streaming generation.
    fn stream(&self, request: GenerateRequest) -> GenerateStream;
}

/// Development provider: streams the last input message back word by word.
/// Lets the server run end to end without a real model adapter wired in.
pub struct EchoProvider;

impl GenerateProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    fn stream(&self, request: GenerateRequest) -> GenerateStream {
        let text = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let mut chunks: Vec<Result<GenerateChunk, ProviderError>> = text
            .split_inclusive(' ')
            .map(|word| Ok(GenerateChunk::Text(word.to_string())))
            .collect();
        chunks.push(Ok(GenerateChunk::Done));

        Box::pin(futures_util::stream::iter(chunks))
    }
}
