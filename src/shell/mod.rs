//! Interactive shell: `%gpt` commands, `%%chat` prompts and plain lines.

pub mod command;
pub mod repl;

pub use command::{Setting, ShellCommand, UsageError};
pub use repl::Shell;
