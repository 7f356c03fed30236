//! Wire-level request and fragment types for the completion endpoint.

use serde::{Deserialize, Serialize};

use crate::chat::core::config::LlmConfig;
use crate::chat::core::message::{ChatMessage, Role};

/// Body of a chat completion call.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompletionRequest {
    /// Model name.
    pub model: String,
    /// Ordered context, ending with the prompt being asked.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature.
    pub temperature: f64,
    /// Whether the reply is streamed as delta fragments.
    pub stream: bool,
    /// Upper bound on generated tokens.
    pub max_tokens: u32,
    /// Number of choices requested.
    pub n: u32,
}

impl CompletionRequest {
    /// Build a request from the session's model parameters.
    #[must_use]
    pub fn new(params: &LlmConfig, messages: Vec<ChatMessage>, stream: bool) -> Self {
        Self {
            model: params.model.clone(),
            messages,
            temperature: params.temperature,
            stream,
            max_tokens: params.max_tokens,
            n: params.n,
        }
    }

    /// The trailing user turn, if the context ends with one.
    #[must_use]
    pub fn prompt(&self) -> Option<&ChatMessage> {
        self.messages.last().filter(|m| m.role == Role::User)
    }
}

/// One incremental unit of a streamed reply.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaFragment {
    /// Author role, normally sent once on the first fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Content chunk to append.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Set on the last fragment of a choice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl DeltaFragment {
    /// Fragment announcing the author role.
    #[must_use]
    pub const fn role(role: Role) -> Self {
        Self {
            role: Some(role),
            content: None,
            finish_reason: None,
        }
    }

    /// Fragment carrying a content chunk.
    #[must_use]
    pub fn content(chunk: impl Into<String>) -> Self {
        Self {
            role: None,
            content: Some(chunk.into()),
            finish_reason: None,
        }
    }

    /// Terminal fragment.
    #[must_use]
    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            role: None,
            content: None,
            finish_reason: Some(reason.into()),
        }
    }

    /// Whether the fragment carries nothing recognizable.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.role.is_none() && self.content.is_none() && self.finish_reason.is_none()
    }
}
