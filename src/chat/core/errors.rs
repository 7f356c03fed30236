//! Error types for the chat subsystem.

use std::time::Duration;

use thiserror::Error;

/// Chat subsystem error type.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Invalid configuration or unsupported values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Input rejected before anything was persisted.
    #[error("validation error: {0}")]
    Validation(String),
    /// Malformed or unexpected data from the completion endpoint.
    #[error("transport error: {0}")]
    Transport(String),
    /// The completion endpoint answered with a non-success status.
    #[error("completion endpoint returned status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Vendor error message, or the raw body when it could not be decoded.
        body: String,
    },
    /// A stored record could not be decoded.
    #[error("corrupt stored record: {0}")]
    CorruptRecord(String),
    /// Token estimation failed.
    #[error("token estimation failed: {0}")]
    Estimation(String),
    /// The caller cancelled an in-flight streaming turn.
    #[error("streaming turn cancelled")]
    Cancelled,
    /// No fragment arrived within the idle timeout.
    #[error("no stream fragment received within {0:?}")]
    Timeout(Duration),
    /// Invalid regular expression in a content edit.
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    /// `SQLite` storage error (sync).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// `SQLite` storage error (async).
    #[error("tokio-rusqlite error: {0}")]
    TokioSqlite(#[from] tokio_rusqlite::Error),
    /// HTTP client error.
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// URL parse error.
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChatError {
    /// Whether a batch completion call failing with this error may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Convenience result alias for chat operations.
pub type ChatResult<T> = Result<T, ChatError>;
