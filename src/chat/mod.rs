//! Conversational chat client: storage, budgeting, summarization and turns.

pub mod context;
pub mod core;
pub mod engine;
pub mod storage;
pub mod summarization;
pub mod tokens;

pub use context::{ContextBudget, ContextTruncator};
pub use self::core::{
    ChatConfig, ChatError, ChatMessage, ChatResult, ContextConfig, ConversationId, EstimatorKind,
    ConversationRecord, LlmConfig, LlmProvider, MessageFilter, MessageId, MessageRecord, Role,
    StorageConfig, StoreBackend,
};
pub use engine::{ChatBackends, Chatbot, TranscriptStyle, TurnStream};
pub use storage::{ChatStore, SqliteChatStore, TableChatStore, open_store};
pub use tokens::{HeuristicEstimator, TokenEstimator, WordCountEstimator, build_estimator};
