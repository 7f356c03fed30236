//! Core chat types and identifiers.

pub mod config;
pub mod errors;
pub mod ids;
pub mod message;

pub use config::{
    ChatConfig, ContextConfig, EstimatorKind, LlmConfig, LlmProvider, StorageConfig,
    StoreBackend,
};
pub use errors::{ChatError, ChatResult};
pub use ids::{ConversationId, MessageId};
pub use message::{
    ChatMessage, ConversationRecord, MessageFilter, MessageRecord, NewMessage, Role,
};
