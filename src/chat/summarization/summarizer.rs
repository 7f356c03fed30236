//! LLM sub-calls that condense a conversation.
//!
//! Both sub-calls are batch completions whose prompt is a fixed instruction
//! and whose context is the slice of conversation to condense. Newlines in
//! the reply are flattened to spaces.

use tracing::debug;

use crate::chat::core::config::{ContextConfig, LlmConfig};
use crate::chat::core::errors::ChatResult;
use crate::chat::core::message::ChatMessage;
use crate::llm::client::CompletionClient;

/// Summarizer for dropped history and conversation titles.
#[derive(Clone)]
pub struct ConversationSummarizer {
    client: CompletionClient,
    summary_prompt: String,
    title_prompt: String,
}

impl ConversationSummarizer {
    /// Create a summarizer using the configured instructions.
    #[must_use]
    pub fn new(client: CompletionClient, config: &ContextConfig) -> Self {
        Self {
            client,
            summary_prompt: config.summary_prompt.clone(),
            title_prompt: config.title_prompt.clone(),
        }
    }

    /// Summarize `messages` (oldest first) into one line of text.
    ///
    /// # Errors
    /// Returns an error if the completion call fails.
    pub async fn summarize(&self, params: &LlmConfig, messages: &[ChatMessage]) -> ChatResult<String> {
        debug!(messages = messages.len(), "Summarizing dropped history");
        self.ask(params, &self.summary_prompt, messages).await
    }

    /// Generate a short title from the opening of a conversation.
    ///
    /// # Errors
    /// Returns an error if the completion call fails.
    pub async fn title(&self, params: &LlmConfig, opening: &[ChatMessage]) -> ChatResult<String> {
        debug!(messages = opening.len(), "Generating conversation title");
        let title = self.ask(params, &self.title_prompt, opening).await?;
        Ok(title.trim().to_string())
    }

    async fn ask(
        &self,
        params: &LlmConfig,
        instruction: &str,
        messages: &[ChatMessage],
    ) -> ChatResult<String> {
        let mut context = messages.to_vec();
        let reply = self.client.submit(params, instruction, &mut context).await?;
        Ok(flatten_newlines(&reply.content))
    }
}

fn flatten_newlines(text: &str) -> String {
    text.replace("\r\n", " ").replace('\n', " ")
}
