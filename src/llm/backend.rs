//! Completion backend seam.

use std::future::Future;
use std::pin::Pin;

use futures::Stream;

use crate::chat::core::errors::ChatResult;
use crate::chat::core::message::ChatMessage;
use crate::llm::request::{CompletionRequest, DeltaFragment};

/// Boxed future type for backend calls.
pub type CompletionFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Ordered stream of delta fragments, ended by the transport.
pub type FragmentStream = Pin<Box<dyn Stream<Item = ChatResult<DeltaFragment>> + Send>>;

/// A remote (or scripted) chat completion endpoint.
pub trait CompletionBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Issue one non-streaming call and return the whole reply.
    ///
    /// # Errors
    /// Returns an error if the call fails or the reply cannot be decoded.
    fn complete(&self, request: CompletionRequest) -> CompletionFuture<'_, ChatResult<ChatMessage>>;

    /// Issue one streaming call and return its fragments.
    ///
    /// # Errors
    /// Returns an error if the call cannot be opened.
    fn stream(&self, request: CompletionRequest) -> CompletionFuture<'_, ChatResult<FragmentStream>>;
}
