//! Configuration for the chat subsystem.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::chat::core::errors::{ChatError, ChatResult};

/// Environment variable holding the completion API key.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Top-level configuration for the chatbot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Storage settings.
    pub storage: StorageConfig,
    /// Completion model settings.
    pub llm: LlmConfig,
    /// Context window settings.
    pub context: ContextConfig,
    /// Optional system instruction, injected per call and never persisted.
    pub system: Option<String>,
}

impl ChatConfig {
    /// Validate configuration invariants, including provider credentials.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> ChatResult<()> {
        self.validate_settings()?;

        if self.llm.provider == LlmProvider::OpenAi {
            Url::parse(&self.llm.base_url)?;
            if self.llm.api_key.as_deref().is_none_or(str::is_empty) {
                return Err(ChatError::InvalidConfig(format!(
                    "an API key is required for the openai provider (set {API_KEY_ENV})"
                )));
            }
        }

        Ok(())
    }

    /// Validate the session settings, leaving provider credentials aside.
    ///
    /// # Errors
    /// Returns an error if any values are out of range.
    pub fn validate_settings(&self) -> ChatResult<()> {
        if self.llm.model.trim().is_empty() {
            return Err(ChatError::InvalidConfig(
                "llm.model must not be empty".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ChatError::InvalidConfig(
                "llm.temperature must be within [0, 2]".to_string(),
            ));
        }

        if self.llm.n == 0 {
            return Err(ChatError::InvalidConfig("llm.n must be > 0".to_string()));
        }

        if self.context.headroom_ratio <= 0.0 || self.context.headroom_ratio > 1.0 {
            return Err(ChatError::InvalidConfig(
                "context.headroom_ratio must be within (0, 1]".to_string(),
            ));
        }

        Ok(())
    }

    /// Build a configuration from defaults overridden by environment variables.
    ///
    /// Recognised variables: `OPENAI_API_KEY`, `CHATBOT_DB_PATH`,
    /// `CHATBOT_TABLE_PATH`, `CHATBOT_STORE` (`sqlite` or `table`),
    /// `CHATBOT_PROVIDER` (`openai` or `stub`), `CHATBOT_ESTIMATOR` (`words` or
    /// `chars`), `CHATBOT_MODEL`, `CHATBOT_BASE_URL`, `CHATBOT_MAX_TOKENS`,
    /// `CHATBOT_SYSTEM`.
    ///
    /// # Errors
    /// Returns an error if a variable holds an unparseable value.
    pub fn from_env() -> ChatResult<Self> {
        let mut config = Self::default();

        if let Ok(key) = std::env::var(API_KEY_ENV) {
            config.llm.api_key = Some(key);
        }
        if let Ok(path) = std::env::var("CHATBOT_DB_PATH") {
            config.storage.sqlite_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("CHATBOT_TABLE_PATH") {
            config.storage.table_path = PathBuf::from(path);
        }
        if let Ok(backend) = std::env::var("CHATBOT_STORE") {
            config.storage.backend = match backend.as_str() {
                "sqlite" => StoreBackend::Sqlite,
                "table" => StoreBackend::Table,
                other => {
                    return Err(ChatError::InvalidConfig(format!(
                        "unknown CHATBOT_STORE value: {other}"
                    )));
                }
            };
        }
        if let Ok(provider) = std::env::var("CHATBOT_PROVIDER") {
            config.llm.provider = match provider.as_str() {
                "openai" => LlmProvider::OpenAi,
                "stub" => LlmProvider::Stub,
                other => {
                    return Err(ChatError::InvalidConfig(format!(
                        "unknown CHATBOT_PROVIDER value: {other}"
                    )));
                }
            };
        }
        if let Ok(estimator) = std::env::var("CHATBOT_ESTIMATOR") {
            config.context.estimator = match estimator.as_str() {
                "words" => EstimatorKind::Words,
                "chars" => EstimatorKind::Chars,
                other => {
                    return Err(ChatError::InvalidConfig(format!(
                        "unknown CHATBOT_ESTIMATOR value: {other}"
                    )));
                }
            };
        }
        if let Ok(model) = std::env::var("CHATBOT_MODEL") {
            config.llm.model = model;
        }
        if let Ok(base_url) = std::env::var("CHATBOT_BASE_URL") {
            config.llm.base_url = base_url;
        }
        if let Ok(max_tokens) = std::env::var("CHATBOT_MAX_TOKENS") {
            config.llm.max_tokens = max_tokens.parse().map_err(|_| {
                ChatError::InvalidConfig(format!("invalid CHATBOT_MAX_TOKENS: {max_tokens}"))
            })?;
        }
        if let Ok(system) = std::env::var("CHATBOT_SYSTEM") {
            config.system = Some(system).filter(|s| !s.is_empty());
        }

        Ok(config)
    }
}

/// Which persistence backend to open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Embedded relational store (`SQLite`).
    #[default]
    Sqlite,
    /// Key-partitioned table store.
    Table,
}

/// Storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selection.
    pub backend: StoreBackend,
    /// `SQLite` database path.
    pub sqlite_path: PathBuf,
    /// Snapshot file of the table store.
    pub table_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let dir = PathBuf::from(home).join(".chatbot");
        Self {
            backend: StoreBackend::Sqlite,
            sqlite_path: dir.join("chat.db"),
            table_path: dir.join("chat-table.json"),
        }
    }
}

/// Which completion backend to talk to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    /// OpenAI-compatible chat completions endpoint.
    #[default]
    OpenAi,
    /// Offline backend answering with a canned reply.
    Stub,
}

/// Completion model settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Backend selection.
    pub provider: LlmProvider,
    /// Bearer token for the endpoint.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Endpoint base URL, without the `/chat/completions` suffix.
    pub base_url: String,
    /// Model name.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Token limit, also the basis of the context budget.
    pub max_tokens: u32,
    /// Number of choices requested.
    pub n: u32,
    /// Timeout for a whole non-streaming call.
    pub request_timeout_secs: u64,
    /// Longest wait between two stream fragments.
    pub stream_idle_timeout_secs: u64,
    /// Retries for non-streaming calls.
    pub max_retries: u32,
    /// First retry delay, doubled on each attempt.
    pub retry_backoff_ms: u64,
}

impl LlmConfig {
    /// Timeout for a whole non-streaming call.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Longest wait between two stream fragments.
    #[must_use]
    pub const fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAi,
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            temperature: 0.8,
            max_tokens: 3200,
            n: 1,
            request_timeout_secs: 120,
            stream_idle_timeout_secs: 60,
            max_retries: 2,
            retry_backoff_ms: 500,
        }
    }
}

/// How message token costs are estimated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    /// Whitespace-separated word count.
    #[default]
    Words,
    /// Character count divided by `chars_per_token`, rounded up.
    Chars,
}

/// Context window settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Token cost estimator.
    pub estimator: EstimatorKind,
    /// Characters per token for [`EstimatorKind::Chars`].
    pub chars_per_token: usize,
    /// Tokens set aside for response overhead.
    pub response_reserve_tokens: u32,
    /// Share of the remaining tokens usable by history.
    pub headroom_ratio: f64,
    /// Instruction sent with the dropped history to obtain a summary.
    pub summary_prompt: String,
    /// Instruction sent with the first exchange to obtain a title.
    pub title_prompt: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            estimator: EstimatorKind::Words,
            chars_per_token: 4,
            response_reserve_tokens: 100,
            headroom_ratio: 0.8,
            summary_prompt: "Can you summarize this conversation:\n\n".to_string(),
            title_prompt: "Can you generate a title for this conversation:\n\n".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ChatConfig {
        let mut config = ChatConfig::default();
        config.llm.api_key = Some("sk-test".to_string());
        config
    }

    #[test]
    fn test_defaults() {
        let config = ChatConfig::default();
        assert_eq!(config.llm.model, "gpt-3.5-turbo");
        assert!((config.llm.temperature - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.llm.max_tokens, 3200);
        assert_eq!(config.llm.n, 1);
        assert_eq!(config.context.response_reserve_tokens, 100);
        assert!(config.storage.sqlite_path.ends_with(".chatbot/chat.db"));
        assert!(config.storage.table_path.ends_with(".chatbot/chat-table.json"));
    }

    #[test]
    fn test_validate_accepts_defaults_with_key() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_requires_api_key_for_openai() {
        let config = ChatConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ChatError::InvalidConfig(_))
        ));

        let mut stub = ChatConfig::default();
        stub.llm.provider = LlmProvider::Stub;
        assert!(stub.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let mut config = valid_config();
        config.llm.temperature = 3.0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.llm.n = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.context.headroom_ratio = 0.0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.llm.base_url = "not a url".to_string();
        assert!(matches!(config.validate(), Err(ChatError::Url(_))));
    }

    #[test]
    fn test_settings_validation_ignores_credentials() {
        let mut config = ChatConfig::default();
        assert!(config.validate_settings().is_ok());
        config.llm.model = "  ".to_string();
        assert!(config.validate_settings().is_err());
    }

    #[test]
    fn test_api_key_is_not_serialized() {
        let json = serde_json::to_string(&valid_config()).unwrap();
        assert!(!json.contains("sk-test"));
    }
}
