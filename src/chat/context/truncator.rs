//! Fit a conversation history into a token budget.
//!
//! History is walked newest to oldest and kept while the running cost stays
//! within budget. Everything older is dropped and replaced by a single
//! assistant-authored summary placed in front of the kept messages.

use std::sync::Arc;

use tracing::{debug, info};

use crate::chat::core::config::{ContextConfig, LlmConfig};
use crate::chat::core::errors::ChatResult;
use crate::chat::core::message::ChatMessage;
use crate::chat::summarization::summarizer::ConversationSummarizer;
use crate::chat::tokens::estimator::TokenEstimator;

/// Maximum estimated cost of a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextBudget {
    max_context_tokens: usize,
}

impl ContextBudget {
    /// `floor(headroom_ratio * (max_tokens - reserve))`, saturating at zero.
    #[must_use]
    pub fn new(max_tokens: u32, reserve_tokens: u32, headroom_ratio: f64) -> Self {
        let available = f64::from(max_tokens.saturating_sub(reserve_tokens));
        let scaled = (headroom_ratio.clamp(0.0, 1.0) * available).floor();
        // Bounded by u32::MAX, so the cast is lossless.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let max_context_tokens = scaled as usize;
        Self { max_context_tokens }
    }

    /// Budget for the session's model parameters.
    #[must_use]
    pub fn from_config(llm: &LlmConfig, context: &ContextConfig) -> Self {
        Self::new(
            llm.max_tokens,
            context.response_reserve_tokens,
            context.headroom_ratio,
        )
    }

    /// Budget of an explicit size.
    #[must_use]
    pub const fn tokens(max_context_tokens: usize) -> Self {
        Self { max_context_tokens }
    }

    /// Maximum cost in estimated tokens.
    #[must_use]
    pub const fn max_context_tokens(self) -> usize {
        self.max_context_tokens
    }
}

/// History partitioned by the budget, both halves oldest first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextSplit {
    /// Most recent messages that fit the budget.
    pub kept: Vec<ChatMessage>,
    /// Older messages to be summarized.
    pub dropped: Vec<ChatMessage>,
}

/// Partition `history` into the recent suffix that fits `budget` and the rest.
///
/// A lone dropped message takes the oldest kept message with it so the
/// summary always stands in for at least two messages when there are two.
#[must_use]
pub fn split_history(
    mut history: Vec<ChatMessage>,
    budget: ContextBudget,
    estimator: &dyn TokenEstimator,
) -> ContextSplit {
    let limit = budget.max_context_tokens();
    let mut used = 0_usize;
    let mut cut = history.len();

    for (index, message) in history.iter().enumerate().rev() {
        let cost = estimator.estimate_message(message);
        match used.checked_add(cost) {
            Some(total) if total <= limit => {
                used = total;
                cut = index;
            }
            _ => break,
        }
    }

    if cut == 1 && history.len() > 1 {
        cut = 2;
    }

    let kept = history.split_off(cut);
    ContextSplit {
        kept,
        dropped: history,
    }
}

/// Builds budgeted contexts, summarizing what does not fit.
#[derive(Clone)]
pub struct ContextTruncator {
    estimator: Arc<dyn TokenEstimator>,
    summarizer: ConversationSummarizer,
}

impl ContextTruncator {
    /// Create a truncator.
    #[must_use]
    pub fn new(estimator: Arc<dyn TokenEstimator>, summarizer: ConversationSummarizer) -> Self {
        Self {
            estimator,
            summarizer,
        }
    }

    /// Fit `history` into `budget`.
    ///
    /// Returns the history unchanged when it fits; otherwise the kept suffix
    /// prefixed by an assistant summary of the dropped prefix. The summary
    /// never costs more than the messages it replaces. Nothing is persisted.
    ///
    /// # Errors
    /// Returns an error if the summarization sub-call fails.
    pub async fn truncate(
        &self,
        history: Vec<ChatMessage>,
        budget: ContextBudget,
        params: &LlmConfig,
    ) -> ChatResult<Vec<ChatMessage>> {
        let total = history.len();
        let ContextSplit { kept, dropped } = split_history(history, budget, self.estimator.as_ref());
        if dropped.is_empty() {
            return Ok(kept);
        }

        info!(
            total,
            dropped = dropped.len(),
            budget = budget.max_context_tokens(),
            "Context over budget, summarizing older messages"
        );
        let dropped_cost = self.estimator.estimate_all(&dropped);
        let summary = self.summarizer.summarize(params, &dropped).await?;
        let summary = clamp_to_cost(&summary, dropped_cost, self.estimator.as_ref());
        debug!(
            dropped_cost,
            summary_cost = self.estimator.estimate(&summary),
            "Summary ready"
        );

        let mut context = Vec::with_capacity(kept.len() + 1);
        context.push(ChatMessage::assistant(summary));
        context.extend(kept);
        Ok(context)
    }
}

/// Longest word prefix of `text` whose estimated cost is within `limit`.
fn clamp_to_cost(text: &str, limit: usize, estimator: &dyn TokenEstimator) -> String {
    if estimator.estimate(text) <= limit {
        return text.to_string();
    }

    let mut clamped = String::new();
    for word in text.split_whitespace() {
        let candidate = if clamped.is_empty() {
            word.to_string()
        } else {
            format!("{clamped} {word}")
        };
        if estimator.estimate(&candidate) > limit {
            break;
        }
        clamped = candidate;
    }
    clamped
}
