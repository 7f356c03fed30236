//! `%gpt` command parsing.

use std::path::PathBuf;

use thiserror::Error;

use crate::chat::core::ids::{ConversationId, MessageId};

/// Usage summary printed by `help`.
pub const HELP: &str = "\
These commands are available via %gpt:

  help                                  print this message
  show                                  print the current conversation
  ls conversations                      list conversations
  ls messages                           list messages of the current conversation
  set conversation_id <id>              switch conversation
  set max_tokens <n>                    set the token budget
  set system <text...>                  set the system instruction (empty clears it)
  set engine <model>                    set the model
  set temperature <t>                   set the sampling temperature
  rm conversation <id>                  delete a conversation
  rm message <id>                       delete a message
  attrs                                 print session settings
  find <text...>                        search message contents
  title [text...]                       set or regenerate the title
  edit <message_id> <pattern> <repl>    regex replace in a message
  upload <path>                         import a JSON list of {role, content}
  quit                                  leave the shell

To talk to the bot, type a line, or start a multi-line prompt with %%chat
and end it with an empty line.";

/// Malformed command line.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0} (try `%gpt help`)")]
pub struct UsageError(String);

impl UsageError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A session setting addressable with `set`.
#[derive(Debug, Clone, PartialEq)]
pub enum Setting {
    /// Active conversation.
    ConversationId(ConversationId),
    /// Token budget for context plus reply.
    MaxTokens(u32),
    /// System instruction; `None` clears it.
    System(Option<String>),
    /// Model name.
    Engine(String),
    /// Sampling temperature.
    Temperature(f64),
}

/// A parsed shell command.
#[derive(Debug, Clone, PartialEq)]
pub enum ShellCommand {
    /// Print usage.
    Help,
    /// Print the transcript.
    Show,
    /// List conversations.
    ListConversations,
    /// List messages of the active conversation.
    ListMessages,
    /// Change a session setting.
    Set(Setting),
    /// Delete a conversation.
    RemoveConversation(ConversationId),
    /// Delete a message.
    RemoveMessage(MessageId),
    /// Print session settings.
    Attributes,
    /// Search message contents.
    Find(String),
    /// Set the title, or regenerate it when `None`.
    Title(Option<String>),
    /// Regex replace in one message.
    Edit {
        /// Target message.
        id: MessageId,
        /// Regular expression.
        pattern: String,
        /// Replacement, `$1` style group references allowed.
        replacement: String,
    },
    /// Import a conversation from a JSON file.
    Upload(PathBuf),
    /// Leave the shell.
    Quit,
}

impl ShellCommand {
    /// Parse the text following `%gpt`.
    ///
    /// # Errors
    /// Returns a [`UsageError`] for unknown commands or bad arguments.
    pub fn parse(line: &str) -> Result<Self, UsageError> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["help"] => Ok(Self::Help),
            ["show"] => Ok(Self::Show),
            ["attrs"] => Ok(Self::Attributes),
            ["quit" | "exit"] => Ok(Self::Quit),
            ["ls", "conversations"] => Ok(Self::ListConversations),
            ["ls", "messages"] => Ok(Self::ListMessages),
            ["ls", ..] => Err(UsageError::new("usage: ls conversations|messages")),
            ["set", "system", rest @ ..] => Ok(Self::Set(Setting::System(
                (!rest.is_empty()).then(|| rest.join(" ")),
            ))),
            ["set", param, value] => parse_setting(param, value).map(Self::Set),
            ["set", ..] => Err(UsageError::new("usage: set <setting> <value>")),
            ["rm", "conversation", id] => parse_number(id).map(Self::RemoveConversation),
            ["rm", "message", id] => parse_number(id).map(Self::RemoveMessage),
            ["rm", ..] => Err(UsageError::new("usage: rm conversation|message <id>")),
            ["find", rest @ ..] if !rest.is_empty() => Ok(Self::Find(rest.join(" "))),
            ["find"] => Err(UsageError::new("usage: find <text>")),
            ["title"] => Ok(Self::Title(None)),
            ["title", rest @ ..] => Ok(Self::Title(Some(rest.join(" ")))),
            ["edit", id, pattern, replacement] => Ok(Self::Edit {
                id: parse_number(id)?,
                pattern: (*pattern).to_string(),
                replacement: (*replacement).to_string(),
            }),
            ["edit", ..] => Err(UsageError::new(
                "usage: edit <message_id> <pattern> <replacement>",
            )),
            ["upload", path] => Ok(Self::Upload(PathBuf::from(path))),
            ["upload", ..] => Err(UsageError::new("usage: upload <path>")),
            [] => Err(UsageError::new("missing command")),
            [other, ..] => Err(UsageError::new(format!("unknown command `{other}`"))),
        }
    }
}

fn parse_setting(param: &str, value: &str) -> Result<Setting, UsageError> {
    match param {
        "conversation_id" => parse_number(value).map(Setting::ConversationId),
        "max_tokens" => parse_number(value).map(Setting::MaxTokens),
        "engine" => Ok(Setting::Engine(value.to_string())),
        "temperature" => parse_number(value).map(Setting::Temperature),
        other => Err(UsageError::new(format!("unknown setting `{other}`"))),
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Result<T, UsageError> {
    value
        .parse()
        .map_err(|_| UsageError::new(format!("`{value}` is not a valid number")))
}
