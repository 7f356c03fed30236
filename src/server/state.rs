//! Application state shared across all request handlers.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::chat::core::config::ChatConfig;
use crate::chat::core::errors::ChatResult;
use crate::chat::engine::chatbot::Chatbot;

/// Shared application state.
///
/// One chatbot behind one lock: requests touching the conversation run one
/// at a time, a streaming turn holding the lock until it ends.
pub struct AppState {
    /// The chatbot serving every request.
    pub chatbot: Arc<Mutex<Chatbot>>,
}

impl AppState {
    /// Wrap an opened chatbot.
    #[must_use]
    pub fn new(chatbot: Chatbot) -> Arc<Self> {
        Arc::new(Self {
            chatbot: Arc::new(Mutex::new(chatbot)),
        })
    }

    /// Open a chatbot from `config` on a fresh conversation.
    ///
    /// # Errors
    /// Returns an error if the chatbot cannot be opened.
    pub async fn from_config(config: ChatConfig) -> ChatResult<Arc<Self>> {
        let chatbot = Chatbot::from_config(config, None).await?;
        Ok(Self::new(chatbot))
    }
}
