//! Line-oriented chat shell.

use std::fmt::Write as _;

use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::chat::core::errors::{ChatError, ChatResult};
use crate::chat::core::message::{ChatMessage, MessageRecord, Role};
use crate::chat::engine::chatbot::{Chatbot, TranscriptStyle};
use crate::chat::engine::turn_stream::TurnStream;
use crate::shell::command::{HELP, Setting, ShellCommand};

const COMMAND_PREFIX: &str = "%gpt";
const MULTILINE_PREFIX: &str = "%%chat";

/// Whether the shell keeps reading after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// Interactive shell over one chatbot.
pub struct Shell {
    chatbot: Chatbot,
    interrupt_on_ctrl_c: bool,
}

impl Shell {
    /// Shell that cancels a streaming reply on Ctrl-C.
    #[must_use]
    pub const fn new(chatbot: Chatbot) -> Self {
        Self {
            chatbot,
            interrupt_on_ctrl_c: true,
        }
    }

    /// Leave Ctrl-C to the process default.
    #[must_use]
    pub const fn without_ctrl_c(mut self) -> Self {
        self.interrupt_on_ctrl_c = false;
        self
    }

    /// Underlying chatbot.
    #[must_use]
    pub const fn chatbot(&self) -> &Chatbot {
        &self.chatbot
    }

    /// Read `input` until EOF or `quit`, writing replies to `output`.
    ///
    /// Chat and command failures are reported on `output` and the shell
    /// keeps going.
    ///
    /// # Errors
    /// Returns an error only if reading input or writing output fails.
    pub async fn run<R, W>(&mut self, input: R, output: &mut W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        let mut pending: Option<String> = None;

        while let Some(line) = lines.next_line().await? {
            if let Some(buffer) = pending.as_mut() {
                if line.trim().is_empty() {
                    let prompt = std::mem::take(buffer);
                    pending = None;
                    self.chat(prompt.trim_end(), output).await?;
                } else {
                    buffer.push_str(&line);
                    buffer.push('\n');
                }
                continue;
            }

            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix(MULTILINE_PREFIX) {
                let mut buffer = String::new();
                if !rest.trim().is_empty() {
                    buffer.push_str(rest.trim());
                    buffer.push('\n');
                }
                pending = Some(buffer);
            } else if let Some(rest) = trimmed.strip_prefix(COMMAND_PREFIX) {
                if self.command(rest, output).await? == Flow::Quit {
                    return Ok(());
                }
            } else if !trimmed.is_empty() {
                self.chat(trimmed, output).await?;
            }
        }

        if let Some(buffer) = pending {
            self.chat(buffer.trim_end(), output).await?;
        }
        Ok(())
    }

    async fn command<W>(&mut self, line: &str, output: &mut W) -> std::io::Result<Flow>
    where
        W: AsyncWrite + Unpin,
    {
        let command = match ShellCommand::parse(line) {
            Ok(command) => command,
            Err(err) => {
                write_text(output, &format!("{err}\n")).await?;
                return Ok(Flow::Continue);
            }
        };
        debug!(?command, "Shell command");
        if command == ShellCommand::Quit {
            return Ok(Flow::Quit);
        }

        let text = match self.execute(command).await {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "Shell command failed");
                format!("error: {err}\n")
            }
        };
        write_text(output, &text).await?;
        Ok(Flow::Continue)
    }

    async fn execute(&mut self, command: ShellCommand) -> ChatResult<String> {
        let mut out = String::new();
        match command {
            ShellCommand::Help => {
                let _ = writeln!(out, "{HELP}");
            }
            ShellCommand::Show => {
                out = self.chatbot.render_transcript(TranscriptStyle::Plain).await?;
            }
            ShellCommand::ListConversations => {
                for conversation in self.chatbot.list_conversations().await? {
                    let _ = writeln!(
                        out,
                        "{}\t{}\t{}",
                        conversation.id,
                        conversation.last_updated.format("%Y-%m-%d %H:%M:%S"),
                        conversation.title.as_deref().unwrap_or("-")
                    );
                }
            }
            ShellCommand::ListMessages => {
                write_messages(&mut out, &self.chatbot.messages().await?);
            }
            ShellCommand::Set(setting) => {
                self.apply(setting).await?;
            }
            ShellCommand::RemoveConversation(id) => {
                self.chatbot.delete_conversation(id).await?;
            }
            ShellCommand::RemoveMessage(id) => {
                self.chatbot.delete_message(id).await?;
            }
            ShellCommand::Attributes => {
                let config = self.chatbot.config();
                let _ = writeln!(out, "conversation_id: {}", self.chatbot.conversation_id());
                let _ = writeln!(out, "max_tokens: {}", config.llm.max_tokens);
                let _ = writeln!(out, "system: {}", config.system.as_deref().unwrap_or(""));
                let _ = writeln!(out, "engine: {}", config.llm.model);
                let _ = writeln!(out, "temperature: {}", config.llm.temperature);
            }
            ShellCommand::Find(text) => {
                write_messages(&mut out, &self.chatbot.find_messages(&text).await?);
            }
            ShellCommand::Title(title) => {
                let title = self.chatbot.update_conversation_title(title).await?;
                let _ = writeln!(out, "{title}");
            }
            ShellCommand::Edit {
                id,
                pattern,
                replacement,
            } => {
                if self.chatbot.edit_message(id, &pattern, &replacement).await? {
                    let _ = writeln!(out, "message {id} updated");
                } else {
                    let _ = writeln!(out, "no message {id}");
                }
            }
            ShellCommand::Upload(path) => {
                let raw = tokio::fs::read_to_string(&path).await?;
                let messages = parse_upload(&raw)?;
                let id = self.chatbot.upload_conversation(messages).await?;
                let _ = writeln!(out, "uploaded as conversation {id}");
            }
            ShellCommand::Quit => {}
        }
        Ok(out)
    }

    async fn apply(&mut self, setting: Setting) -> ChatResult<()> {
        match setting {
            Setting::ConversationId(id) => self.chatbot.switch_conversation(id).await?,
            Setting::MaxTokens(max_tokens) => self.chatbot.set_max_tokens(max_tokens),
            Setting::System(system) => self.chatbot.set_system(system),
            Setting::Engine(model) => self.chatbot.set_model(model)?,
            Setting::Temperature(temperature) => self.chatbot.set_temperature(temperature)?,
        }
        Ok(())
    }

    /// Stream one turn to `output`, line by line.
    async fn chat<W>(&mut self, prompt: &str, output: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if prompt.is_empty() {
            return Ok(());
        }
        let mut turn = match self.chatbot.submit_turn_streaming(prompt).await {
            Ok(turn) => turn,
            Err(err) => {
                warn!(error = %err, "Turn failed before streaming");
                return write_text(output, &format!("error: {err}\n")).await;
            }
        };

        let interrupt = self.interrupt_on_ctrl_c.then(|| {
            let cancel = turn.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        });

        let streamed = stream_lines(&mut turn, output).await;
        if let Some(handle) = interrupt {
            handle.abort();
        }
        let (ends_with_newline, failure) = streamed?;

        let mut tail = String::new();
        if !ends_with_newline {
            tail.push('\n');
        }
        match failure {
            Some(err) => {
                warn!(error = %err, "Streaming turn ended early");
                let _ = writeln!(tail, "error: {err}");
            }
            None => {
                if let Err(err) = turn.finish().await {
                    warn!(error = %err, "Turn could not be stored");
                    let _ = writeln!(tail, "error: {err}");
                }
            }
        }
        write_text(output, &tail).await
    }
}

/// Copy lines to `output` until the reply ends or fails.
///
/// Returns whether the last line ended with a newline, and the stream error
/// if there was one.
async fn stream_lines<W>(
    turn: &mut TurnStream,
    output: &mut W,
) -> std::io::Result<(bool, Option<ChatError>)>
where
    W: AsyncWrite + Unpin,
{
    let mut ends_with_newline = true;
    while let Some(line) = turn.next_line().await {
        match line {
            Ok(line) => {
                ends_with_newline = line.ends_with('\n');
                write_text(output, &line).await?;
            }
            Err(err) => return Ok((ends_with_newline, Some(err))),
        }
    }
    Ok((ends_with_newline, None))
}

/// One entry of an uploaded conversation file, role not yet checked.
#[derive(Debug, Deserialize)]
struct UploadedMessage {
    role: String,
    content: String,
}

/// Decode an upload file; an unknown role is a `Validation` error.
fn parse_upload(raw: &str) -> ChatResult<Vec<ChatMessage>> {
    let entries: Vec<UploadedMessage> = serde_json::from_str(raw)?;
    entries
        .into_iter()
        .map(|entry| {
            let role: Role = entry.role.parse().map_err(|role| {
                ChatError::Validation(format!(
                    "invalid role {role} in uploaded conversation, must be user or assistant"
                ))
            })?;
            Ok(ChatMessage::new(role, entry.content))
        })
        .collect()
}

fn write_messages(out: &mut String, messages: &[MessageRecord]) {
    for message in messages {
        let _ = writeln!(
            out,
            "{}\t{}:{}\t{}\t{}",
            message.id,
            message.conversation_id,
            message.conversation_position,
            message.role,
            message.content.replace('\n', " ")
        );
    }
}

async fn write_text<W>(output: &mut W, text: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if text.is_empty() {
        return Ok(());
    }
    output.write_all(text.as_bytes()).await?;
    output.flush().await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::chat::core::config::{ChatConfig, LlmProvider};
    use crate::chat::core::message::{MessageFilter, Role};
    use crate::chat::storage::store::ChatStore;
    use crate::chat::storage::table_store::TableChatStore;
    use crate::llm::request::DeltaFragment;
    use crate::llm::stub::StubBackend;

    async fn shell(stub: &Arc<StubBackend>) -> (Shell, Arc<dyn ChatStore>) {
        let mut config = ChatConfig::default();
        config.llm.provider = LlmProvider::Stub;
        let store: Arc<dyn ChatStore> = Arc::new(TableChatStore::new());
        let chatbot = Chatbot::open(config, store.clone(), stub.clone(), None)
            .await
            .unwrap();
        (Shell::new(chatbot).without_ctrl_c(), store)
    }

    async fn run(shell: &mut Shell, input: &str) -> String {
        let mut output = Vec::new();
        shell.run(input.as_bytes(), &mut output).await.unwrap();
        String::from_utf8(output).unwrap()
    }

    #[tokio::test]
    async fn test_plain_line_streams_and_persists() {
        let stub = Arc::new(StubBackend::new("A title"));
        stub.push_stream(StubBackend::fragments_for("Paris is the capital."));
        let (mut shell, store) = shell(&stub).await;

        let output = run(&mut shell, "What is the capital of France?\n").await;

        assert_eq!(output, "Paris is the capital.\n");
        let stored = store.list_messages(MessageFilter::all()).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].content, "What is the capital of France?");
        assert_eq!(stored[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_multiline_prompt_ends_on_blank_line() {
        let stub = Arc::new(StubBackend::new("A title"));
        stub.push_stream(StubBackend::fragments_for("ok"));
        let (mut shell, store) = shell(&stub).await;

        run(&mut shell, "%%chat\nfirst line\nsecond line\n\n").await;

        let stored = store.list_messages(MessageFilter::all()).await.unwrap();
        assert_eq!(stored[0].content, "first line\nsecond line");
    }

    #[tokio::test]
    async fn test_stream_error_is_reported_and_not_stored() {
        let stub = Arc::new(StubBackend::new("unused"));
        stub.push_stream(vec![
            Ok(DeltaFragment::content("half")),
            Err(ChatError::Transport("reset".to_string())),
        ]);
        let (mut shell, store) = shell(&stub).await;

        let output = run(&mut shell, "hello\n").await;

        assert!(output.contains("error: transport error: reset"));
        assert!(
            store
                .list_messages(MessageFilter::all())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_set_and_attrs() {
        let stub = Arc::new(StubBackend::default());
        let (mut shell, _) = shell(&stub).await;

        let output = run(
            &mut shell,
            "%gpt set engine gpt-4\n%gpt set temperature 0.5\n%gpt set max_tokens 900\n\
             %gpt set system Be brief.\n%gpt attrs\n",
        )
        .await;

        assert!(output.contains("conversation_id: 1\n"));
        assert!(output.contains("max_tokens: 900\n"));
        assert!(output.contains("system: Be brief.\n"));
        assert!(output.contains("engine: gpt-4\n"));
        assert!(output.contains("temperature: 0.5\n"));
    }

    #[tokio::test]
    async fn test_invalid_setting_value_is_reported() {
        let stub = Arc::new(StubBackend::default());
        let (mut shell, _) = shell(&stub).await;

        let output = run(&mut shell, "%gpt set temperature 7\n").await;

        assert!(output.starts_with("error: invalid configuration"));
        assert!((shell.chatbot().config().llm.temperature - 0.8).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_unknown_command_leaves_store_untouched() {
        let stub = Arc::new(StubBackend::default());
        let (mut shell, store) = shell(&stub).await;

        let output = run(&mut shell, "%gpt dance\n").await;

        assert!(output.contains("unknown command `dance`"));
        assert!(stub.requests().is_empty());
        assert_eq!(store.list_conversations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_quit_stops_reading() {
        let stub = Arc::new(StubBackend::default());
        let (mut shell, _) = shell(&stub).await;

        run(&mut shell, "%gpt quit\nnever sent\n").await;

        assert!(stub.requests().is_empty());
    }

    #[tokio::test]
    async fn test_title_edit_and_find() {
        let stub = Arc::new(StubBackend::new("Generated"));
        stub.push_stream(StubBackend::fragments_for("Contact me at bob@example.com"));
        let (mut shell, store) = shell(&stub).await;
        run(&mut shell, "hi\n").await;

        let reply_id = store.list_messages(MessageFilter::all()).await.unwrap()[1].id;
        let output = run(
            &mut shell,
            &format!(
                "%gpt title Email thread\n%gpt edit {reply_id} (\\w+)@example $1@test\n%gpt find bob@test\n"
            ),
        )
        .await;

        assert!(output.contains("Email thread\n"));
        assert!(output.contains(&format!("message {reply_id} updated")));
        assert!(output.contains("Contact me at bob@test.com"));
        assert_eq!(
            shell.chatbot().title().await.unwrap().as_deref(),
            Some("Email thread")
        );
    }

    #[tokio::test]
    async fn test_upload_from_file() {
        let stub = Arc::new(StubBackend::new("Imported"));
        let (mut shell, store) = shell(&stub).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.json");
        std::fs::write(
            &path,
            r#"[{"role":"user","content":"hello"},{"role":"assistant","content":"hi"}]"#,
        )
        .unwrap();

        let output = run(&mut shell, &format!("%gpt upload {}\n", path.display())).await;

        assert_eq!(output, "uploaded as conversation 2\n");
        assert_eq!(shell.chatbot().conversation_id().get(), 2);
        let attributes = store
            .get_conversation_attributes(shell.chatbot().conversation_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attributes.title.as_deref(), Some("Imported"));
    }

    #[tokio::test]
    async fn test_ls_and_rm() {
        let stub = Arc::new(StubBackend::new("T"));
        stub.push_stream(StubBackend::fragments_for("reply"));
        let (mut shell, store) = shell(&stub).await;
        run(&mut shell, "question\n").await;
        let first = store.list_messages(MessageFilter::all()).await.unwrap()[0].id;

        let output = run(&mut shell, &format!("%gpt rm message {first}\n%gpt ls messages\n")).await;

        assert_eq!(output.lines().count(), 1);
        assert!(output.contains("assistant\treply"));
    }

    #[test]
    fn test_parse_upload_rejects_unknown_role() {
        let parsed = parse_upload(r#"[{"role":"user","content":"hi"},{"role":"tool","content":"x"}]"#);
        assert!(matches!(parsed, Err(ChatError::Validation(ref msg)) if msg.contains("tool")));

        assert!(matches!(
            parse_upload("not json"),
            Err(ChatError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_with_tool_role_is_validation_error() {
        let stub = Arc::new(StubBackend::new("unused"));
        let (mut shell, store) = shell(&stub).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.json");
        std::fs::write(
            &path,
            r#"[{"role":"user","content":"hello"},{"role":"tool","content":"result"}]"#,
        )
        .unwrap();

        let output = run(&mut shell, &format!("%gpt upload {}\n", path.display())).await;

        assert!(output.starts_with("error: validation error: invalid role tool"));
        assert_eq!(store.list_conversations().await.unwrap().len(), 1);
        assert!(stub.requests().is_empty());
    }
}
