//! Deterministic, monotonic token cost estimators.
//!
//! Counts only need to be stable and never shrink when text grows; they are
//! not meant to match any vendor tokenizer.

use tracing::warn;

use crate::chat::core::errors::ChatResult;
use crate::chat::core::message::ChatMessage;

/// Maps text to an integer cost used for budgeting.
pub trait TokenEstimator: Send + Sync {
    /// Estimate the cost of `text`.
    ///
    /// # Errors
    /// Returns an error if the underlying estimation mechanism fails.
    fn try_estimate(&self, text: &str) -> ChatResult<usize>;

    /// Estimate the cost of `text`, yielding `0` when estimation fails.
    fn estimate(&self, text: &str) -> usize {
        match self.try_estimate(text) {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, chars = text.len(), "Token estimation failed, counting 0");
                0
            }
        }
    }

    /// Cost of one context message.
    fn estimate_message(&self, message: &ChatMessage) -> usize {
        self.estimate(&message.content)
    }

    /// Cost of a whole context.
    fn estimate_all(&self, messages: &[ChatMessage]) -> usize {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }
}

/// Whitespace-separated word count.
#[derive(Clone, Copy, Debug, Default)]
pub struct WordCountEstimator;

impl TokenEstimator for WordCountEstimator {
    fn try_estimate(&self, text: &str) -> ChatResult<usize> {
        Ok(text.split_whitespace().count())
    }
}

/// Character-based approximation: one token per `chars_per_token` chars, rounded up.
#[derive(Clone, Copy, Debug)]
pub struct HeuristicEstimator {
    chars_per_token: usize,
}

impl HeuristicEstimator {
    /// Create an estimator; a ratio of `0` is treated as `1`.
    #[must_use]
    pub const fn new(chars_per_token: usize) -> Self {
        let chars_per_token = if chars_per_token == 0 { 1 } else { chars_per_token };
        Self { chars_per_token }
    }
}

impl Default for HeuristicEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn try_estimate(&self, text: &str) -> ChatResult<usize> {
        Ok(text.chars().count().div_ceil(self.chars_per_token))
    }
}
