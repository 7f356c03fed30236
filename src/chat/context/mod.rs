//! Bounded context assembly from stored history.

pub mod truncator;

pub use truncator::{ContextBudget, ContextSplit, ContextTruncator, split_history};
