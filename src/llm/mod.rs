//! Completion endpoint access: wire types, backends and stream assembly.

pub mod backend;
pub mod client;
pub mod openai;
pub mod request;
pub mod stream;
pub mod stub;

use std::sync::Arc;

use crate::chat::core::config::{LlmConfig, LlmProvider};
use crate::chat::core::errors::ChatResult;

pub use backend::{CompletionBackend, CompletionFuture, FragmentStream};
pub use client::CompletionClient;
pub use openai::OpenAiBackend;
pub use request::{CompletionRequest, DeltaFragment};
pub use stream::{LineBuffer, MessageAssembler, StreamOutcome, StreamingReply};
pub use stub::StubBackend;

/// Build the backend selected by `config`.
///
/// # Errors
/// Returns an error if the OpenAI backend cannot be configured.
pub fn build_backend(config: &LlmConfig) -> ChatResult<Arc<dyn CompletionBackend>> {
    let backend: Arc<dyn CompletionBackend> = match config.provider {
        LlmProvider::OpenAi => Arc::new(OpenAiBackend::new(config)?),
        LlmProvider::Stub => Arc::new(StubBackend::default()),
    };
    Ok(backend)
}
