//! Conversation orchestration.

pub mod chatbot;
pub mod turn_stream;

pub use chatbot::{ChatBackends, Chatbot, TranscriptStyle, UNTITLED};
pub use turn_stream::TurnStream;
