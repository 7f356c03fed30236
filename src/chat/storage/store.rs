//! Store abstraction shared by every persistence backend.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use regex::Regex;
use tracing::info;

use crate::chat::core::config::{StorageConfig, StoreBackend};
use crate::chat::core::errors::ChatResult;
use crate::chat::core::ids::{ConversationId, MessageId};
use crate::chat::core::message::{
    ChatMessage, ConversationRecord, MessageFilter, MessageRecord, NewMessage,
};
use crate::chat::storage::sqlite_store::SqliteChatStore;
use crate::chat::storage::table_store::TableChatStore;

/// Boxed future type for store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable storage of conversations and their ordered messages.
///
/// Every mutating call commits on its own; nothing spans two calls.
pub trait ChatStore: Send + Sync {
    /// Create the conversation and message collections if absent.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn create_schema(&self) -> StoreFuture<'_, ChatResult<()>>;
    /// Highest conversation id, or `0` when there is none.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn max_conversation_id(&self) -> StoreFuture<'_, ChatResult<ConversationId>>;
    /// Insert an untitled conversation.
    ///
    /// # Errors
    /// Returns an error if storage access fails or the id is taken.
    fn put_conversation(&self, id: ConversationId) -> StoreFuture<'_, ChatResult<()>>;
    /// Set the title of a conversation.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn update_conversation_title(
        &self,
        id: ConversationId,
        title: String,
    ) -> StoreFuture<'_, ChatResult<()>>;
    /// Refresh `last_updated`.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn touch_conversation(&self, id: ConversationId) -> StoreFuture<'_, ChatResult<()>>;
    /// Load the attributes of a conversation.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn get_conversation_attributes(
        &self,
        id: ConversationId,
    ) -> StoreFuture<'_, ChatResult<Option<ConversationRecord>>>;
    /// All conversations, most recently updated first.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn list_conversations(&self) -> StoreFuture<'_, ChatResult<Vec<ConversationRecord>>>;
    /// Persist a message and return its assigned id.
    ///
    /// # Errors
    /// Returns an error if storage access fails or the position is taken.
    fn put_message(&self, message: NewMessage) -> StoreFuture<'_, ChatResult<MessageId>>;
    /// Role/content pairs of a conversation by ascending position.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn get_context(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, ChatResult<Vec<ChatMessage>>>;
    /// The position the next message of a conversation should take.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn next_position(&self, conversation_id: ConversationId) -> StoreFuture<'_, ChatResult<i64>>;
    /// Load one message.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn get_message(&self, id: MessageId) -> StoreFuture<'_, ChatResult<Option<MessageRecord>>>;
    /// Delete one message. Missing ids are ignored; positions are not renumbered.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn delete_message(&self, id: MessageId) -> StoreFuture<'_, ChatResult<()>>;
    /// Replace every match of `pattern` in a message's content.
    ///
    /// Returns `false` when the message does not exist.
    ///
    /// # Errors
    /// Returns an error if the pattern is invalid or storage access fails.
    fn update_message_content(
        &self,
        id: MessageId,
        pattern: String,
        replacement: String,
    ) -> StoreFuture<'_, ChatResult<bool>>;
    /// Delete a conversation and all of its messages. Missing ids are ignored.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn delete_conversation(&self, id: ConversationId) -> StoreFuture<'_, ChatResult<()>>;
    /// Messages whose content contains `needle` (case-sensitive).
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn find_messages(&self, needle: String) -> StoreFuture<'_, ChatResult<Vec<MessageRecord>>>;
    /// Messages passing `filter`, ordered by conversation then position.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn list_messages(&self, filter: MessageFilter)
    -> StoreFuture<'_, ChatResult<Vec<MessageRecord>>>;
}

/// Open the backend named by `config`, with its schema created.
///
/// # Errors
/// Returns an error if the backend cannot be opened.
pub async fn open_store(config: &StorageConfig) -> ChatResult<Arc<dyn ChatStore>> {
    let store: Arc<dyn ChatStore> = match config.backend {
        StoreBackend::Sqlite => Arc::new(SqliteChatStore::open(&config.sqlite_path).await?),
        StoreBackend::Table => Arc::new(TableChatStore::open(&config.table_path).await?),
    };
    store.create_schema().await?;
    info!(backend = ?config.backend, "Chat store ready");
    Ok(store)
}

/// Apply a content edit, shared by the backends.
pub(crate) fn substitute(content: &str, pattern: &Regex, replacement: &str) -> String {
    pattern.replace_all(content, replacement).into_owned()
}
