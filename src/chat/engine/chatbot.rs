//! Conversation orchestration.

use std::fmt::Write as _;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::context::truncator::{ContextBudget, ContextTruncator};
use crate::chat::core::config::ChatConfig;
use crate::chat::core::errors::{ChatError, ChatResult};
use crate::chat::core::ids::{ConversationId, MessageId};
use crate::chat::core::message::{
    ChatMessage, ConversationRecord, MessageFilter, MessageRecord, NewMessage, Role,
};
use crate::chat::engine::turn_stream::TurnStream;
use crate::chat::storage::store::{ChatStore, open_store};
use crate::chat::summarization::summarizer::ConversationSummarizer;
use crate::chat::tokens::build_estimator;
use crate::chat::tokens::estimator::TokenEstimator;
use crate::llm::backend::CompletionBackend;
use crate::llm::build_backend;
use crate::llm::client::CompletionClient;

/// Title shown for conversations that have none yet.
pub const UNTITLED: &str = "Untitled conversation";

/// Backend dependencies for the chatbot.
pub struct ChatBackends {
    /// Persistence store.
    pub store: Arc<dyn ChatStore>,
    /// Completion endpoint.
    pub completion: Arc<dyn CompletionBackend>,
    /// Token cost estimator.
    pub estimator: Arc<dyn TokenEstimator>,
}

impl ChatBackends {
    /// Open the store and completion backend named by `config`.
    ///
    /// # Errors
    /// Returns an error if either backend cannot be initialized.
    pub async fn from_config(config: &ChatConfig) -> ChatResult<Self> {
        let store = open_store(&config.storage).await?;
        let completion = build_backend(&config.llm)?;
        Ok(Self {
            store,
            completion,
            estimator: build_estimator(&config.context),
        })
    }
}

/// Transcript rendering style.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TranscriptStyle {
    /// Markdown with a title heading and bold role labels.
    #[default]
    Markdown,
    /// Plain text.
    Plain,
}

/// Persists completed turns and keeps the conversation title current.
#[derive(Clone)]
pub(crate) struct TurnRecorder {
    store: Arc<dyn ChatStore>,
    estimator: Arc<dyn TokenEstimator>,
    summarizer: ConversationSummarizer,
    config: ChatConfig,
    conversation_id: ConversationId,
}

impl TurnRecorder {
    /// Store the user and assistant turns at the next two positions.
    pub(crate) async fn record(&self, user_turn: ChatMessage, reply: &ChatMessage) -> ChatResult<()> {
        let position = self.store.next_position(self.conversation_id).await?;
        self.put(user_turn, position).await?;
        self.put(reply.clone(), position + 1).await?;

        let attributes = self
            .store
            .get_conversation_attributes(self.conversation_id)
            .await?;
        if attributes.and_then(|record| record.title).is_none() {
            // The turn is already stored; a failed title is retried next turn.
            if let Err(err) = self.generate_title().await {
                warn!(
                    conversation_id = %self.conversation_id,
                    error = %err,
                    "Title generation failed"
                );
            }
        }

        self.store.touch_conversation(self.conversation_id).await?;
        debug!(
            conversation_id = %self.conversation_id,
            position,
            "Turn persisted"
        );
        Ok(())
    }

    async fn put(&self, message: ChatMessage, position: i64) -> ChatResult<MessageId> {
        let token_count = i64::try_from(self.estimator.estimate(&message.content)).unwrap_or(i64::MAX);
        self.store
            .put_message(NewMessage {
                message,
                conversation_id: self.conversation_id,
                conversation_position: position,
                token_count,
            })
            .await
    }

    /// Generate a title from the first exchange and persist it.
    async fn generate_title(&self) -> ChatResult<String> {
        let opening: Vec<ChatMessage> = self
            .store
            .get_context(self.conversation_id)
            .await?
            .into_iter()
            .take(2)
            .collect();
        if opening.is_empty() {
            return Err(ChatError::Validation(format!(
                "conversation {} has no messages to title",
                self.conversation_id
            )));
        }

        let title = self.summarizer.title(&self.config.llm, &opening).await?;
        self.store
            .update_conversation_title(self.conversation_id, title.clone())
            .await?;
        info!(conversation_id = %self.conversation_id, title = %title, "Conversation titled");
        Ok(title)
    }
}

/// Façade over one active conversation.
pub struct Chatbot {
    config: ChatConfig,
    store: Arc<dyn ChatStore>,
    estimator: Arc<dyn TokenEstimator>,
    client: CompletionClient,
    summarizer: ConversationSummarizer,
    truncator: ContextTruncator,
    conversation_id: ConversationId,
}

impl Chatbot {
    /// Open a chatbot over explicit backends with the configured estimator.
    ///
    /// # Errors
    /// Returns an error if settings are invalid or the store fails.
    pub async fn open(
        config: ChatConfig,
        store: Arc<dyn ChatStore>,
        completion: Arc<dyn CompletionBackend>,
        conversation_id: Option<ConversationId>,
    ) -> ChatResult<Self> {
        let backends = ChatBackends {
            store,
            completion,
            estimator: build_estimator(&config.context),
        };
        Self::with_backends(config, backends, conversation_id).await
    }

    /// Open a chatbot with backends built from `config`.
    ///
    /// # Errors
    /// Returns an error if configuration is invalid or a backend fails.
    pub async fn from_config(
        config: ChatConfig,
        conversation_id: Option<ConversationId>,
    ) -> ChatResult<Self> {
        config.validate()?;
        let backends = ChatBackends::from_config(&config).await?;
        Self::with_backends(config, backends, conversation_id).await
    }

    /// Open a chatbot over `backends`.
    ///
    /// Creates the schema, removes abandoned conversations (untitled and
    /// empty), then resumes `conversation_id` or starts a new conversation.
    ///
    /// # Errors
    /// Returns an error if settings are invalid or the store fails.
    pub async fn with_backends(
        config: ChatConfig,
        backends: ChatBackends,
        conversation_id: Option<ConversationId>,
    ) -> ChatResult<Self> {
        config.validate_settings()?;
        let ChatBackends {
            store,
            completion,
            estimator,
        } = backends;

        store.create_schema().await?;
        remove_abandoned(store.as_ref()).await?;

        let client = CompletionClient::new(completion);
        let summarizer = ConversationSummarizer::new(client.clone(), &config.context);
        let truncator = ContextTruncator::new(estimator.clone(), summarizer.clone());

        let conversation_id = match conversation_id {
            Some(id) => {
                ensure_conversation(store.as_ref(), id).await?;
                id
            }
            None => {
                let id = store.max_conversation_id().await?.next();
                store.put_conversation(id).await?;
                id
            }
        };
        info!(
            conversation_id = %conversation_id,
            backend = client.backend().name(),
            model = %config.llm.model,
            "Chatbot ready"
        );

        Ok(Self {
            config,
            store,
            estimator,
            client,
            summarizer,
            truncator,
            conversation_id,
        })
    }

    /// Active conversation id.
    #[must_use]
    pub const fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Current session settings.
    #[must_use]
    pub const fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Title of the active conversation, if generated yet.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub async fn title(&self) -> ChatResult<Option<String>> {
        Ok(self
            .conversation_attributes()
            .await?
            .and_then(|record| record.title))
    }

    /// Stored attributes of the active conversation.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub async fn conversation_attributes(&self) -> ChatResult<Option<ConversationRecord>> {
        self.store
            .get_conversation_attributes(self.conversation_id)
            .await
    }

    /// Submit a prompt and wait for the whole reply.
    ///
    /// Both turns are persisted after the reply arrives; on failure nothing is.
    ///
    /// # Errors
    /// Returns an error if the completion call or storage access fails.
    pub async fn submit_turn(&mut self, prompt: &str) -> ChatResult<ChatMessage> {
        info!(conversation_id = %self.conversation_id, chars = prompt.len(), "Submitting turn");
        let mut context = self.prepare_context().await?;
        let reply = self
            .client
            .submit(&self.config.llm, prompt, &mut context)
            .await?;

        let user_turn = context
            .pop()
            .unwrap_or_else(|| ChatMessage::user(prompt));
        self.recorder().record(user_turn, &reply).await?;
        Ok(reply)
    }

    /// Submit a prompt and stream the reply line by line.
    ///
    /// The turn is persisted once the returned stream is exhausted without
    /// error; an error or cancellation leaves the store untouched.
    ///
    /// # Errors
    /// Returns an error if the context cannot be built or the stream opened.
    pub async fn submit_turn_streaming(&mut self, prompt: &str) -> ChatResult<TurnStream> {
        self.submit_turn_streaming_with(prompt, CancellationToken::new())
            .await
    }

    /// Like [`Self::submit_turn_streaming`], aborted when `cancel` fires.
    ///
    /// # Errors
    /// Returns an error if the context cannot be built or the stream opened.
    pub async fn submit_turn_streaming_with(
        &mut self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> ChatResult<TurnStream> {
        info!(
            conversation_id = %self.conversation_id,
            chars = prompt.len(),
            "Submitting streaming turn"
        );
        let context = self.prepare_context().await?;
        let reply = self
            .client
            .submit_streaming(&self.config.llm, prompt, &context, cancel)
            .await?;
        Ok(TurnStream::new(reply, self.recorder()))
    }

    /// Import a conversation as a new conversation and make it active.
    ///
    /// # Errors
    /// Returns `Validation` for an empty list or a role other than user or
    /// assistant, before anything is persisted.
    pub async fn upload_conversation(&mut self, messages: Vec<ChatMessage>) -> ChatResult<ConversationId> {
        if messages.is_empty() {
            return Err(ChatError::Validation(
                "cannot upload an empty conversation".to_string(),
            ));
        }
        if let Some(invalid) = messages
            .iter()
            .find(|m| !matches!(m.role, Role::User | Role::Assistant))
        {
            return Err(ChatError::Validation(format!(
                "invalid role {} in uploaded conversation, must be user or assistant",
                invalid.role
            )));
        }

        let id = self.store.max_conversation_id().await?.next();
        self.store.put_conversation(id).await?;
        self.conversation_id = id;

        let recorder = self.recorder();
        let count = messages.len();
        for (position, message) in (0_i64..).zip(messages) {
            recorder.put(message, position).await?;
        }
        if let Err(err) = recorder.generate_title().await {
            warn!(conversation_id = %id, error = %err, "Title generation failed");
        }
        self.store.touch_conversation(id).await?;

        info!(conversation_id = %id, messages = count, "Conversation uploaded");
        Ok(id)
    }

    /// Set the title explicitly, or regenerate it from the first exchange.
    ///
    /// # Errors
    /// Returns an error if generation or storage access fails.
    pub async fn update_conversation_title(&self, title: Option<String>) -> ChatResult<String> {
        match title {
            Some(title) => {
                self.store
                    .update_conversation_title(self.conversation_id, title.clone())
                    .await?;
                Ok(title)
            }
            None => self.recorder().generate_title().await,
        }
    }

    /// Make `id` the active conversation, creating it if absent.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub async fn switch_conversation(&mut self, id: ConversationId) -> ChatResult<()> {
        ensure_conversation(self.store.as_ref(), id).await?;
        self.conversation_id = id;
        debug!(conversation_id = %id, "Switched conversation");
        Ok(())
    }

    /// Set the model name.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for an empty name.
    pub fn set_model(&mut self, model: impl Into<String>) -> ChatResult<()> {
        let model = model.into();
        if model.trim().is_empty() {
            return Err(ChatError::InvalidConfig(
                "model must not be empty".to_string(),
            ));
        }
        self.config.llm.model = model;
        Ok(())
    }

    /// Set the sampling temperature.
    ///
    /// # Errors
    /// Returns `InvalidConfig` outside `[0, 2]`.
    pub fn set_temperature(&mut self, temperature: f64) -> ChatResult<()> {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ChatError::InvalidConfig(
                "temperature must be within [0, 2]".to_string(),
            ));
        }
        self.config.llm.temperature = temperature;
        Ok(())
    }

    /// Set the generation limit, which also drives the context budget.
    pub fn set_max_tokens(&mut self, max_tokens: u32) {
        self.config.llm.max_tokens = max_tokens;
    }

    /// Set or clear the system instruction.
    pub fn set_system(&mut self, system: Option<String>) {
        self.config.system = system.filter(|s| !s.trim().is_empty());
    }

    /// Messages of the active conversation by position.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub async fn messages(&self) -> ChatResult<Vec<MessageRecord>> {
        self.store
            .list_messages(MessageFilter::conversation(self.conversation_id))
            .await
    }

    /// Messages in any conversation containing `text`.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub async fn find_messages(&self, text: &str) -> ChatResult<Vec<MessageRecord>> {
        self.store.find_messages(text.to_string()).await
    }

    /// All conversations, most recently updated first.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub async fn list_conversations(&self) -> ChatResult<Vec<ConversationRecord>> {
        self.store.list_conversations().await
    }

    /// Delete one message. Missing ids are ignored.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub async fn delete_message(&self, id: MessageId) -> ChatResult<()> {
        self.store.delete_message(id).await
    }

    /// Regex-replace within one message; `false` if it does not exist.
    ///
    /// # Errors
    /// Returns an error if the pattern is invalid or storage access fails.
    pub async fn edit_message(&self, id: MessageId, pattern: &str, replacement: &str) -> ChatResult<bool> {
        self.store
            .update_message_content(id, pattern.to_string(), replacement.to_string())
            .await
    }

    /// Delete a conversation and its messages. Missing ids are ignored.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub async fn delete_conversation(&self, id: ConversationId) -> ChatResult<()> {
        self.store.delete_conversation(id).await?;
        info!(conversation_id = %id, "Conversation deleted");
        Ok(())
    }

    /// Delete several conversations.
    ///
    /// # Errors
    /// Returns the first storage error; earlier deletions stay applied.
    pub async fn delete_conversations(&self, ids: &[ConversationId]) -> ChatResult<()> {
        for id in ids {
            self.delete_conversation(*id).await?;
        }
        Ok(())
    }

    /// Render the active conversation, title first.
    ///
    /// A missing title is generated when the conversation has messages.
    ///
    /// # Errors
    /// Returns an error if title generation or storage access fails.
    pub async fn render_transcript(&self, style: TranscriptStyle) -> ChatResult<String> {
        let context = self.store.get_context(self.conversation_id).await?;
        let title = match self.title().await? {
            Some(title) => title,
            None if !context.is_empty() => self.recorder().generate_title().await?,
            None => UNTITLED.to_string(),
        };

        let mut output = String::new();
        match style {
            TranscriptStyle::Markdown => {
                let _ = write!(output, "# {title}\n\n");
                for message in &context {
                    let _ = write!(
                        output,
                        "**{}**:\n{}\n\n",
                        message.role.as_str().to_uppercase(),
                        message.content.replace('\n', "  \n")
                    );
                }
            }
            TranscriptStyle::Plain => {
                let _ = write!(output, "{title}\n\n");
                for message in &context {
                    let _ = write!(
                        output,
                        "{}\n{}\n\n",
                        message.role.as_str().to_uppercase(),
                        message.content
                    );
                }
            }
        }
        Ok(output)
    }

    /// Context for the next call: budgeted history, system instruction first.
    async fn prepare_context(&self) -> ChatResult<Vec<ChatMessage>> {
        let history = self.store.get_context(self.conversation_id).await?;
        let budget = ContextBudget::from_config(&self.config.llm, &self.config.context);
        let mut context = self
            .truncator
            .truncate(history, budget, &self.config.llm)
            .await?;
        if let Some(system) = &self.config.system {
            context.insert(0, ChatMessage::system(system.clone()));
        }
        Ok(context)
    }

    fn recorder(&self) -> TurnRecorder {
        TurnRecorder {
            store: self.store.clone(),
            estimator: self.estimator.clone(),
            summarizer: self.summarizer.clone(),
            config: self.config.clone(),
            conversation_id: self.conversation_id,
        }
    }
}

async fn ensure_conversation(store: &dyn ChatStore, id: ConversationId) -> ChatResult<()> {
    if store.get_conversation_attributes(id).await?.is_none() {
        store.put_conversation(id).await?;
    }
    Ok(())
}

/// Delete conversations left untitled and empty by an earlier session.
async fn remove_abandoned(store: &dyn ChatStore) -> ChatResult<()> {
    let mut removed = 0_usize;
    for conversation in store.list_conversations().await? {
        if conversation.title.is_some() {
            continue;
        }
        let messages = store
            .list_messages(MessageFilter::conversation(conversation.id))
            .await?;
        if messages.is_empty() {
            store.delete_conversation(conversation.id).await?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!(removed, "Removed abandoned conversations");
    }
    Ok(())
}
