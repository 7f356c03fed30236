//! Embedded relational store backed by `SQLite`.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;
use tracing::debug;

use crate::chat::core::errors::{ChatError, ChatResult};
use crate::chat::core::ids::{ConversationId, MessageId};
use crate::chat::core::message::{
    ChatMessage, ConversationRecord, MessageFilter, MessageRecord, NewMessage, Role,
};
use crate::chat::storage::store::{ChatStore, StoreFuture, substitute};

const MESSAGE_COLUMNS: &str =
    "id, role, content, conversation_id, conversation_position, token_count";

type RawMessage = (i64, String, String, i64, i64, i64);
type RawConversation = (i64, Option<String>, Option<String>, i64);

/// `SQLite` implementation of the chat store.
pub struct SqliteChatStore {
    conn: Connection,
}

impl SqliteChatStore {
    /// Open (or create) a database file, creating its parent directory.
    ///
    /// # Errors
    /// Returns an error if the directory or database cannot be opened.
    pub async fn open(path: &Path) -> ChatResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = Connection::open(path).await?;
        debug!(path = %path.display(), "Opened sqlite chat store");
        Ok(Self { conn })
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be created.
    pub async fn open_in_memory() -> ChatResult<Self> {
        let conn = Connection::open_in_memory().await?;
        Ok(Self { conn })
    }
}

/// A unique-key violation is a caller error, reported like the table store does.
fn constraint_as_validation(
    err: tokio_rusqlite::Error,
    message: impl FnOnce() -> String,
) -> ChatError {
    match err {
        tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(failure, _))
            if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            ChatError::Validation(message())
        }
        other => ChatError::TokioSqlite(other),
    }
}

fn read_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn read_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawConversation> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn parse_role(role: &str) -> ChatResult<Role> {
    Role::from_str(role).map_err(|err| ChatError::CorruptRecord(format!("invalid role: {err}")))
}

fn to_message(raw: RawMessage) -> ChatResult<MessageRecord> {
    let (id, role, content, conversation_id, conversation_position, token_count) = raw;
    Ok(MessageRecord {
        id: MessageId::new(id),
        role: parse_role(&role)?,
        content,
        conversation_id: ConversationId::new(conversation_id),
        conversation_position,
        token_count,
    })
}

fn to_conversation(raw: RawConversation) -> ChatResult<ConversationRecord> {
    let (id, title, tags, last_updated_ms) = raw;
    Ok(ConversationRecord {
        id: ConversationId::new(id),
        title,
        tags,
        last_updated: from_millis(last_updated_ms)?,
    })
}

fn from_millis(millis: i64) -> ChatResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| ChatError::CorruptRecord(format!("invalid timestamp: {millis}")))
}

impl ChatStore for SqliteChatStore {
    fn create_schema(&self) -> StoreFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            self.conn
                .call(|conn| {
                    conn.execute_batch(
                        "CREATE TABLE IF NOT EXISTS conversations (
                            id INTEGER PRIMARY KEY,
                            title TEXT,
                            tags TEXT,
                            last_updated INTEGER NOT NULL
                        );
                        CREATE TABLE IF NOT EXISTS messages (
                            id INTEGER PRIMARY KEY AUTOINCREMENT,
                            role TEXT NOT NULL,
                            content TEXT NOT NULL,
                            conversation_id INTEGER NOT NULL,
                            conversation_position INTEGER NOT NULL,
                            token_count INTEGER NOT NULL DEFAULT 0
                        );
                        CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_conversation_position
                            ON messages (conversation_id, conversation_position);",
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }

    fn max_conversation_id(&self) -> StoreFuture<'_, ChatResult<ConversationId>> {
        Box::pin(async move {
            let max = self
                .conn
                .call(|conn| {
                    let max = conn.query_row(
                        "SELECT COALESCE(MAX(id), 0) FROM conversations",
                        [],
                        |row| row.get::<_, i64>(0),
                    )?;
                    Ok(max)
                })
                .await?;
            Ok(ConversationId::new(max))
        })
    }

    fn put_conversation(&self, id: ConversationId) -> StoreFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            let now = Utc::now().timestamp_millis();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        "INSERT INTO conversations (id, last_updated) VALUES (?1, ?2)",
                        rusqlite::params![id.get(), now],
                    )?;
                    Ok(())
                })
                .await
                .map_err(|err| {
                    constraint_as_validation(err, || format!("conversation {id} already exists"))
                })?;
            Ok(())
        })
    }

    fn update_conversation_title(
        &self,
        id: ConversationId,
        title: String,
    ) -> StoreFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            self.conn
                .call(move |conn| {
                    conn.execute(
                        "UPDATE conversations SET title = ?1 WHERE id = ?2",
                        rusqlite::params![title, id.get()],
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }

    fn touch_conversation(&self, id: ConversationId) -> StoreFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            let now = Utc::now().timestamp_millis();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        "UPDATE conversations SET last_updated = ?1 WHERE id = ?2",
                        rusqlite::params![now, id.get()],
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }

    fn get_conversation_attributes(
        &self,
        id: ConversationId,
    ) -> StoreFuture<'_, ChatResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            let row = self
                .conn
                .call(move |conn| {
                    let row = conn
                        .query_row(
                            "SELECT id, title, tags, last_updated FROM conversations WHERE id = ?1",
                            rusqlite::params![id.get()],
                            read_conversation,
                        )
                        .optional()?;
                    Ok(row)
                })
                .await?;
            row.map(to_conversation).transpose()
        })
    }

    fn list_conversations(&self) -> StoreFuture<'_, ChatResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let rows = self
                .conn
                .call(|conn| {
                    let mut stmt = conn.prepare(
                        "SELECT id, title, tags, last_updated FROM conversations
                         ORDER BY last_updated DESC, id DESC",
                    )?;
                    let rows = stmt
                        .query_map([], read_conversation)?
                        .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                    Ok(rows)
                })
                .await?;
            rows.into_iter().map(to_conversation).collect()
        })
    }

    fn put_message(&self, message: NewMessage) -> StoreFuture<'_, ChatResult<MessageId>> {
        Box::pin(async move {
            let conversation_id = message.conversation_id;
            let position = message.conversation_position;
            let id = self
                .conn
                .call(move |conn| {
                    conn.execute(
                        "INSERT INTO messages
                         (role, content, conversation_id, conversation_position, token_count)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        rusqlite::params![
                            message.message.role.as_str(),
                            message.message.content,
                            message.conversation_id.get(),
                            message.conversation_position,
                            message.token_count
                        ],
                    )?;
                    Ok(conn.last_insert_rowid())
                })
                .await
                .map_err(|err| {
                    constraint_as_validation(err, || {
                        format!("position {position} already used in conversation {conversation_id}")
                    })
                })?;
            Ok(MessageId::new(id))
        })
    }

    fn get_context(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, ChatResult<Vec<ChatMessage>>> {
        Box::pin(async move {
            let rows = self
                .conn
                .call(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT role, content FROM messages
                         WHERE conversation_id = ?1
                         ORDER BY conversation_position",
                    )?;
                    let rows = stmt
                        .query_map(rusqlite::params![conversation_id.get()], |row| {
                            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                        })?
                        .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                    Ok(rows)
                })
                .await?;

            rows.into_iter()
                .map(|(role, content)| Ok(ChatMessage::new(parse_role(&role)?, content)))
                .collect()
        })
    }

    fn next_position(&self, conversation_id: ConversationId) -> StoreFuture<'_, ChatResult<i64>> {
        Box::pin(async move {
            let next = self
                .conn
                .call(move |conn| {
                    let next = conn.query_row(
                        "SELECT COALESCE(MAX(conversation_position) + 1, 0)
                         FROM messages WHERE conversation_id = ?1",
                        rusqlite::params![conversation_id.get()],
                        |row| row.get::<_, i64>(0),
                    )?;
                    Ok(next)
                })
                .await?;
            Ok(next)
        })
    }

    fn get_message(&self, id: MessageId) -> StoreFuture<'_, ChatResult<Option<MessageRecord>>> {
        Box::pin(async move {
            let row = self
                .conn
                .call(move |conn| {
                    let row = conn
                        .query_row(
                            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                            rusqlite::params![id.get()],
                            read_message,
                        )
                        .optional()?;
                    Ok(row)
                })
                .await?;
            row.map(to_message).transpose()
        })
    }

    fn delete_message(&self, id: MessageId) -> StoreFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            self.conn
                .call(move |conn| {
                    conn.execute(
                        "DELETE FROM messages WHERE id = ?1",
                        rusqlite::params![id.get()],
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
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
            let updated = self
                .conn
                .call(move |conn| {
                    let tx = conn.transaction()?;
                    let content = tx
                        .query_row(
                            "SELECT content FROM messages WHERE id = ?1",
                            rusqlite::params![id.get()],
                            |row| row.get::<_, String>(0),
                        )
                        .optional()?;
                    let Some(content) = content else {
                        return Ok(false);
                    };
                    let content = substitute(&content, &pattern, &replacement);
                    tx.execute(
                        "UPDATE messages SET content = ?1 WHERE id = ?2",
                        rusqlite::params![content, id.get()],
                    )?;
                    tx.commit()?;
                    Ok(true)
                })
                .await?;
            Ok(updated)
        })
    }

    fn delete_conversation(&self, id: ConversationId) -> StoreFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            self.conn
                .call(move |conn| {
                    let tx = conn.transaction()?;
                    tx.execute(
                        "DELETE FROM messages WHERE conversation_id = ?1",
                        rusqlite::params![id.get()],
                    )?;
                    tx.execute(
                        "DELETE FROM conversations WHERE id = ?1",
                        rusqlite::params![id.get()],
                    )?;
                    tx.commit()?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }

    fn find_messages(&self, needle: String) -> StoreFuture<'_, ChatResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let rows = self
                .conn
                .call(move |conn| {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages
                         WHERE instr(content, ?1) > 0
                         ORDER BY conversation_id, conversation_position"
                    ))?;
                    let rows = stmt
                        .query_map(rusqlite::params![needle], read_message)?
                        .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                    Ok(rows)
                })
                .await?;
            rows.into_iter().map(to_message).collect()
        })
    }

    fn list_messages(
        &self,
        filter: MessageFilter,
    ) -> StoreFuture<'_, ChatResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let conversation = filter.conversation_id.map(ConversationId::get);
            let role = filter.role.map(|role| role.as_str().to_string());
            let rows = self
                .conn
                .call(move |conn| {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages
                         WHERE (?1 IS NULL OR conversation_id = ?1)
                           AND (?2 IS NULL OR role = ?2)
                         ORDER BY conversation_id, conversation_position"
                    ))?;
                    let rows = stmt
                        .query_map(rusqlite::params![conversation, role], read_message)?
                        .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                    Ok(rows)
                })
                .await?;
            rows.into_iter().map(to_message).collect()
        })
    }
}
