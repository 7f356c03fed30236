//! Persistence backends for conversations and messages.

pub mod sqlite_store;
pub mod store;
pub mod table_store;

#[cfg(test)]
mod conformance;

pub use sqlite_store::SqliteChatStore;
pub use store::{ChatStore, StoreFuture, open_store};
pub use table_store::TableChatStore;
