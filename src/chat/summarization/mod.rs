//! Summary and title generation through the completion client.

pub mod summarizer;

pub use summarizer::ConversationSummarizer;
