//! Key-partitioned table store.
//!
//! Messages live in one partition per conversation, sorted by position, the
//! layout of a NoSQL table keyed by `(conversation_id, conversation_position)`.
//! Conversations live in their own table keyed by id.
//!
//! A store opened with [`TableChatStore::open`] is durable: every mutation
//! rewrites a JSON snapshot of both tables, and opening loads it back.
//! [`TableChatStore::new`] keeps everything in process memory only.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::chat::core::errors::{ChatError, ChatResult};
use crate::chat::core::ids::{ConversationId, MessageId};
use crate::chat::core::message::{
    ChatMessage, ConversationRecord, MessageFilter, MessageRecord, NewMessage,
};
use crate::chat::storage::store::{ChatStore, StoreFuture, substitute};

type Partition = BTreeMap<i64, MessageRecord>;

/// On-disk form of both tables.
#[derive(Debug, Default, Serialize, Deserialize)]
struct TableSnapshot {
    last_message_id: i64,
    conversations: Vec<ConversationRecord>,
    messages: Vec<MessageRecord>,
}

/// Table implementation of the chat store.
#[derive(Debug, Default)]
pub struct TableChatStore {
    conversations: DashMap<ConversationId, ConversationRecord>,
    partitions: DashMap<ConversationId, Partition>,
    message_keys: DashMap<MessageId, (ConversationId, i64)>,
    last_message_id: AtomicI64,
    snapshot_path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl TableChatStore {
    /// Create an empty store held in memory only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a durable store at `path`, loading an existing snapshot.
    ///
    /// # Errors
    /// Returns an error if the parent directory cannot be created or the
    /// snapshot cannot be read or decoded.
    pub async fn open(path: &Path) -> ChatResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let snapshot = match tokio::fs::read(path).await {
            Ok(raw) => serde_json::from_slice::<TableSnapshot>(&raw).map_err(|err| {
                ChatError::CorruptRecord(format!(
                    "table snapshot {}: {err}",
                    path.display()
                ))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => TableSnapshot::default(),
            Err(err) => return Err(err.into()),
        };

        let store = Self {
            snapshot_path: Some(path.to_path_buf()),
            last_message_id: AtomicI64::new(snapshot.last_message_id),
            ..Self::default()
        };
        for conversation in snapshot.conversations {
            store.conversations.insert(conversation.id, conversation);
        }
        let count = snapshot.messages.len();
        for record in snapshot.messages {
            let key = (record.conversation_id, record.conversation_position);
            store.message_keys.insert(record.id, key);
            store
                .partitions
                .entry(record.conversation_id)
                .or_default()
                .insert(record.conversation_position, record);
        }
        debug!(path = %path.display(), messages = count, "Opened table chat store");
        Ok(store)
    }

    /// Rewrite the snapshot, if this store has one.
    async fn persist(&self) -> ChatResult<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let snapshot = TableSnapshot {
            last_message_id: self.last_message_id.load(Ordering::SeqCst),
            conversations: self
                .conversations
                .iter()
                .map(|entry| entry.value().clone())
                .collect(),
            messages: self.collect_messages(|_| true),
        };
        let raw = serde_json::to_vec(&snapshot)?;
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, raw).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }

    fn collect_messages(&self, keep: impl Fn(&MessageRecord) -> bool) -> Vec<MessageRecord> {
        let mut records: Vec<MessageRecord> = self
            .partitions
            .iter()
            .flat_map(|partition| {
                partition
                    .value()
                    .values()
                    .filter(|record| keep(record))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        records.sort_by_key(|record| (record.conversation_id, record.conversation_position));
        records
    }
}

impl ChatStore for TableChatStore {
    fn create_schema(&self) -> StoreFuture<'_, ChatResult<()>> {
        Box::pin(async move { Ok(()) })
    }

    fn max_conversation_id(&self) -> StoreFuture<'_, ChatResult<ConversationId>> {
        Box::pin(async move {
            Ok(self
                .conversations
                .iter()
                .map(|entry| *entry.key())
                .max()
                .unwrap_or_default())
        })
    }

    fn put_conversation(&self, id: ConversationId) -> StoreFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            if self.conversations.contains_key(&id) {
                return Err(ChatError::Validation(format!(
                    "conversation {id} already exists"
                )));
            }
            self.conversations.insert(
                id,
                ConversationRecord {
                    id,
                    title: None,
                    tags: None,
                    last_updated: Utc::now(),
                },
            );
            self.persist().await
        })
    }

    fn update_conversation_title(
        &self,
        id: ConversationId,
        title: String,
    ) -> StoreFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            if let Some(mut record) = self.conversations.get_mut(&id) {
                record.title = Some(title);
            } else {
                return Ok(());
            }
            self.persist().await
        })
    }

    fn touch_conversation(&self, id: ConversationId) -> StoreFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            if let Some(mut record) = self.conversations.get_mut(&id) {
                record.last_updated = Utc::now();
            } else {
                return Ok(());
            }
            self.persist().await
        })
    }

    fn get_conversation_attributes(
        &self,
        id: ConversationId,
    ) -> StoreFuture<'_, ChatResult<Option<ConversationRecord>>> {
        Box::pin(async move { Ok(self.conversations.get(&id).map(|r| r.value().clone())) })
    }

    fn list_conversations(&self) -> StoreFuture<'_, ChatResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let mut records: Vec<ConversationRecord> = self
                .conversations
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            records.sort_by(|a, b| {
                b.last_updated
                    .cmp(&a.last_updated)
                    .then_with(|| b.id.cmp(&a.id))
            });
            Ok(records)
        })
    }

    fn put_message(&self, message: NewMessage) -> StoreFuture<'_, ChatResult<MessageId>> {
        Box::pin(async move {
            let conversation_id = message.conversation_id;
            let position = message.conversation_position;
            let mut partition = self.partitions.entry(conversation_id).or_default();
            if partition.contains_key(&position) {
                return Err(ChatError::Validation(format!(
                    "position {position} already used in conversation {conversation_id}"
                )));
            }

            let id = MessageId::new(self.last_message_id.fetch_add(1, Ordering::SeqCst) + 1);
            partition.insert(
                position,
                MessageRecord {
                    id,
                    role: message.message.role,
                    content: message.message.content,
                    conversation_id,
                    conversation_position: position,
                    token_count: message.token_count,
                },
            );
            drop(partition);
            self.message_keys.insert(id, (conversation_id, position));
            self.persist().await?;
            Ok(id)
        })
    }

    fn get_context(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, ChatResult<Vec<ChatMessage>>> {
        Box::pin(async move {
            Ok(self
                .partitions
                .get(&conversation_id)
                .map(|partition| {
                    partition
                        .values()
                        .map(MessageRecord::to_chat_message)
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn next_position(&self, conversation_id: ConversationId) -> StoreFuture<'_, ChatResult<i64>> {
        Box::pin(async move {
            Ok(self
                .partitions
                .get(&conversation_id)
                .and_then(|partition| partition.keys().next_back().map(|last| last + 1))
                .unwrap_or(0))
        })
    }

    fn get_message(&self, id: MessageId) -> StoreFuture<'_, ChatResult<Option<MessageRecord>>> {
        Box::pin(async move {
            let Some(key) = self.message_keys.get(&id).map(|entry| *entry.value()) else {
                return Ok(None);
            };
            let (conversation_id, position) = key;
            Ok(self
                .partitions
                .get(&conversation_id)
                .and_then(|partition| partition.get(&position).cloned()))
        })
    }

    fn delete_message(&self, id: MessageId) -> StoreFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            let Some((_, (conversation_id, position))) = self.message_keys.remove(&id) else {
                return Ok(());
            };
            if let Some(mut partition) = self.partitions.get_mut(&conversation_id) {
                partition.remove(&position);
            }
            self.persist().await
        })
    }

    fn update_message_content(
        &self,
        id: MessageId,
        pattern: String,
        replacement: String,
    ) -> StoreFuture<'_, ChatResult<bool>> {
        Box::pin(async move {
            let pattern = Regex::new(&pattern)?;
            let Some(key) = self.message_keys.get(&id).map(|entry| *entry.value()) else {
                return Ok(false);
            };
            let (conversation_id, position) = key;
            let updated = self
                .partitions
                .get_mut(&conversation_id)
                .and_then(|mut partition| {
                    let record = partition.get_mut(&position)?;
                    record.content = substitute(&record.content, &pattern, &replacement);
                    Some(())
                })
                .is_some();
            if updated {
                self.persist().await?;
            }
            Ok(updated)
        })
    }

    fn delete_conversation(&self, id: ConversationId) -> StoreFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            let partition = self.partitions.remove(&id);
            if let Some((_, partition)) = &partition {
                for record in partition.values() {
                    self.message_keys.remove(&record.id);
                }
            }
            let conversation = self.conversations.remove(&id);
            if partition.is_none() && conversation.is_none() {
                return Ok(());
            }
            self.persist().await
        })
    }

    fn find_messages(&self, needle: String) -> StoreFuture<'_, ChatResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            Ok(self.collect_messages(|record| record.content.contains(needle.as_str())))
        })
    }

    fn list_messages(
        &self,
        filter: MessageFilter,
    ) -> StoreFuture<'_, ChatResult<Vec<MessageRecord>>> {
        Box::pin(async move { Ok(self.collect_messages(|record| filter.matches(record))) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::storage::conformance;

    #[tokio::test]
    async fn test_conformance() {
        conformance::run_all(&TableChatStore::new()).await;
    }

    #[tokio::test]
    async fn test_message_ids_are_not_reused_after_delete() {
        let store = TableChatStore::new();
        let first = store
            .put_message(NewMessage {
                message: ChatMessage::user("one"),
                conversation_id: ConversationId::new(1),
                conversation_position: 0,
                token_count: 1,
            })
            .await
            .unwrap();
        store.delete_message(first).await.unwrap();

        let second = store
            .put_message(NewMessage {
                message: ChatMessage::user("two"),
                conversation_id: ConversationId::new(1),
                conversation_position: 1,
                token_count: 1,
            })
            .await
            .unwrap();
        assert!(second > first);
    }

    fn message(conversation: i64, position: i64, content: &str) -> NewMessage {
        NewMessage {
            message: ChatMessage::user(content),
            conversation_id: ConversationId::new(conversation),
            conversation_position: position,
            token_count: 1,
        }
    }

    #[tokio::test]
    async fn test_durable_conformance() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableChatStore::open(&dir.path().join("chat.json")).await.unwrap();
        conformance::run_all(&store).await;
    }

    #[tokio::test]
    async fn test_reopen_restores_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chat.json");

        let first_id = {
            let store = TableChatStore::open(&path).await.unwrap();
            store.put_conversation(ConversationId::new(1)).await.unwrap();
            store
                .update_conversation_title(ConversationId::new(1), "Kept".to_string())
                .await
                .unwrap();
            let id = store.put_message(message(1, 0, "hello")).await.unwrap();
            store.put_message(message(1, 1, "world")).await.unwrap();
            id
        };

        let store = TableChatStore::open(&path).await.unwrap();
        assert_eq!(store.max_conversation_id().await.unwrap(), ConversationId::new(1));
        assert_eq!(
            store
                .get_conversation_attributes(ConversationId::new(1))
                .await
                .unwrap()
                .unwrap()
                .title
                .as_deref(),
            Some("Kept")
        );
        assert_eq!(
            store.get_context(ConversationId::new(1)).await.unwrap(),
            vec![ChatMessage::user("hello"), ChatMessage::user("world")]
        );
        assert_eq!(
            store.get_message(first_id).await.unwrap().unwrap().content,
            "hello"
        );

        let next = store.put_message(message(1, 2, "again")).await.unwrap();
        assert!(next.get() > 2);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            TableChatStore::open(&path).await,
            Err(ChatError::CorruptRecord(_))
        ));
    }
}
