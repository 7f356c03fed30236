//! Token estimation for context budgeting.

pub mod estimator;

use std::sync::Arc;

use crate::chat::core::config::{ContextConfig, EstimatorKind};

pub use estimator::{HeuristicEstimator, TokenEstimator, WordCountEstimator};

/// Build the estimator selected by `config`.
#[must_use]
pub fn build_estimator(config: &ContextConfig) -> Arc<dyn TokenEstimator> {
    match config.estimator {
        EstimatorKind::Words => Arc::new(WordCountEstimator),
        EstimatorKind::Chars => Arc::new(HeuristicEstimator::new(config.chars_per_token)),
    }
}
