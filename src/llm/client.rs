//! Completion client: batch calls with retries, streaming calls without.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chat::core::config::LlmConfig;
use crate::chat::core::errors::ChatResult;
use crate::chat::core::message::ChatMessage;
use crate::llm::backend::CompletionBackend;
use crate::llm::request::CompletionRequest;
use crate::llm::stream::StreamingReply;

const MAX_BACKOFF_SHIFT: u32 = 10;

/// Front end over a completion backend.
#[derive(Clone)]
pub struct CompletionClient {
    backend: Arc<dyn CompletionBackend>,
}

impl CompletionClient {
    /// Wrap a backend.
    #[must_use]
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }

    /// The wrapped backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn CompletionBackend> {
        &self.backend
    }

    /// Append `prompt` to `context` as a user turn and fetch the whole reply.
    ///
    /// The context keeps the appended turn even when the call fails.
    ///
    /// # Errors
    /// Returns the last error once retries are exhausted, or the first
    /// non-retryable error.
    pub async fn submit(
        &self,
        params: &LlmConfig,
        prompt: &str,
        context: &mut Vec<ChatMessage>,
    ) -> ChatResult<ChatMessage> {
        context.push(ChatMessage::user(prompt));
        let request = CompletionRequest::new(params, context.clone(), false);

        let mut attempt = 0;
        loop {
            match self.backend.complete(request.clone()).await {
                Ok(reply) => {
                    debug!(
                        backend = self.backend.name(),
                        messages = request.messages.len(),
                        attempt,
                        "Completion received"
                    );
                    return Ok(reply);
                }
                Err(err) if err.is_retryable() && attempt < params.max_retries => {
                    let delay = backoff(params.retry_backoff_ms, attempt);
                    attempt += 1;
                    warn!(
                        backend = self.backend.name(),
                        attempt,
                        max_retries = params.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Completion call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Open a streaming call for `prompt` after `context`.
    ///
    /// `context` itself is left untouched; the appended user turn is carried
    /// by the returned reply.
    ///
    /// # Errors
    /// Returns an error if the stream cannot be opened. Never retried.
    pub async fn submit_streaming(
        &self,
        params: &LlmConfig,
        prompt: &str,
        context: &[ChatMessage],
        cancel: CancellationToken,
    ) -> ChatResult<StreamingReply> {
        let user_turn = ChatMessage::user(prompt);
        let mut messages = context.to_vec();
        messages.push(user_turn.clone());
        let request = CompletionRequest::new(params, messages, true);

        debug!(
            backend = self.backend.name(),
            messages = request.messages.len(),
            "Opening streaming completion"
        );
        let fragments = self.backend.stream(request).await?;
        Ok(StreamingReply::new(
            fragments,
            user_turn,
            params.stream_idle_timeout(),
            cancel,
        ))
    }
}

fn backoff(base_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(1_u64 << attempt.min(MAX_BACKOFF_SHIFT)))
}
