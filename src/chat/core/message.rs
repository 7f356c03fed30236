//! Message and conversation records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::core::ids::{ConversationId, MessageId};

/// Author role of a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// System instruction.
    System,
    /// User input.
    User,
    /// Model response.
    Assistant,
}

impl Role {
    /// Stable string form for storage and the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(value.to_string()),
        }
    }
}

/// One element of a context: a role and its content.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Build a message with an arbitrary role.
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Build a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Build a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Build an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A persisted message.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Store-assigned identifier.
    pub id: MessageId,
    /// Author role.
    pub role: Role,
    /// Message text.
    pub content: String,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Zero-based position inside the conversation. Gaps are allowed after deletes.
    pub conversation_position: i64,
    /// Estimated token cost of `content`.
    pub token_count: i64,
}

impl MessageRecord {
    /// Drop the storage fields, keeping the context pair.
    #[must_use]
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }
}

/// A message ready to be stored; the store assigns the id.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewMessage {
    /// Role and content.
    pub message: ChatMessage,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Position inside the conversation.
    pub conversation_position: i64,
    /// Estimated token cost.
    pub token_count: i64,
}

/// Conversation attributes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// Conversation identifier.
    pub id: ConversationId,
    /// Generated or user-supplied title; `None` until a title pass runs.
    pub title: Option<String>,
    /// Free-form tags.
    pub tags: Option<String>,
    /// Refreshed on every completed turn.
    pub last_updated: DateTime<Utc>,
}

/// Predicate for listing messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageFilter {
    /// Only messages of this conversation.
    pub conversation_id: Option<ConversationId>,
    /// Only messages with this role.
    pub role: Option<Role>,
}

impl MessageFilter {
    /// Filter matching every message.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            conversation_id: None,
            role: None,
        }
    }

    /// Filter on one conversation.
    #[must_use]
    pub const fn conversation(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            role: None,
        }
    }

    /// Restrict to a role.
    #[must_use]
    pub const fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    /// Whether a record passes the filter.
    #[must_use]
    pub fn matches(&self, record: &MessageRecord) -> bool {
        self.conversation_id
            .is_none_or(|id| id == record.conversation_id)
            && self.role.is_none_or(|role| role == record.role)
    }
}
