//! Reassembly of streamed replies.
//!
//! `MessageAssembler` folds delta fragments into one message, `LineBuffer`
//! turns content chunks into line-buffered partial output, and
//! `StreamingReply` drives a fragment stream through both with an idle
//! timeout and a cancellation token.

use std::mem;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chat::core::errors::{ChatError, ChatResult};
use crate::chat::core::message::{ChatMessage, Role};
use crate::llm::backend::FragmentStream;
use crate::llm::request::DeltaFragment;

/// Accumulates fragments into a single message.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    role: Option<Role>,
    content: String,
    finish_reason: Option<String>,
}

impl MessageAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one fragment in, returning its content chunk if any.
    ///
    /// # Errors
    /// Returns `Transport` for a fragment with no role, content or finish
    /// marker, and for a role that contradicts an earlier one.
    pub fn push<'f>(&mut self, fragment: &'f DeltaFragment) -> ChatResult<Option<&'f str>> {
        if fragment.is_empty() {
            return Err(ChatError::Transport(
                "fragment carried no role, content or finish marker".to_string(),
            ));
        }

        if let Some(role) = fragment.role {
            match self.role {
                None => self.role = Some(role),
                Some(existing) if existing == role => {}
                Some(existing) => {
                    return Err(ChatError::Transport(format!(
                        "fragment role {role} conflicts with {existing}"
                    )));
                }
            }
        }

        if let Some(reason) = &fragment.finish_reason {
            self.finish_reason = Some(reason.clone());
        }

        let chunk = fragment.content.as_deref();
        if let Some(chunk) = chunk {
            self.content.push_str(chunk);
        }
        Ok(chunk)
    }

    /// Content accumulated so far.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Finish reason reported by the endpoint, if any.
    #[must_use]
    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    /// The assembled message; the role defaults to assistant.
    #[must_use]
    pub fn finish(self) -> ChatMessage {
        ChatMessage::new(self.role.unwrap_or(Role::Assistant), self.content)
    }
}

/// Line-buffered emission of content chunks.
///
/// Whenever an appended chunk contains a newline, everything buffered so far
/// is emitted and the buffer is reset. A trailing partial line is released
/// by `flush` at end of stream.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk, returning the buffered text if the chunk ends a line.
    pub fn push(&mut self, chunk: &str) -> Option<String> {
        self.pending.push_str(chunk);
        chunk.contains('\n').then(|| mem::take(&mut self.pending))
    }

    /// Release whatever is left, if anything.
    pub fn flush(&mut self) -> Option<String> {
        (!self.pending.is_empty()).then(|| mem::take(&mut self.pending))
    }
}

/// Result of a completed streaming call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamOutcome {
    /// The reassembled reply.
    pub final_message: ChatMessage,
    /// The user turn that was appended to the context for this call.
    pub appended_user_turn: ChatMessage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReplyState {
    Streaming,
    Exhausted,
    Failed,
}

/// An in-flight streaming reply. Single pass: once exhausted it yields nothing.
pub struct StreamingReply {
    fragments: FragmentStream,
    assembler: MessageAssembler,
    lines: LineBuffer,
    appended_user_turn: ChatMessage,
    idle_timeout: Duration,
    cancel: CancellationToken,
    state: ReplyState,
}

impl StreamingReply {
    /// Wrap a fragment stream.
    #[must_use]
    pub fn new(
        fragments: FragmentStream,
        appended_user_turn: ChatMessage,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fragments,
            assembler: MessageAssembler::new(),
            lines: LineBuffer::new(),
            appended_user_turn,
            idle_timeout,
            cancel,
            state: ReplyState::Streaming,
        }
    }

    /// Token that aborts this reply when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the stream ended normally.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.state == ReplyState::Exhausted
    }

    /// Text received so far.
    #[must_use]
    pub fn content(&self) -> &str {
        self.assembler.content()
    }

    /// Next partial line, or `None` once the stream has ended.
    ///
    /// After an error the reply yields nothing further.
    pub async fn next_line(&mut self) -> Option<ChatResult<String>> {
        loop {
            if self.state != ReplyState::Streaming {
                return None;
            }

            let idle_timeout = self.idle_timeout;
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Err(ChatError::Cancelled),
                next = tokio::time::timeout(idle_timeout, self.fragments.next()) => {
                    next.map_err(|_| ChatError::Timeout(idle_timeout))
                }
            };

            let fragment = match next {
                Ok(Some(Ok(fragment))) => fragment,
                Ok(None) => {
                    self.state = ReplyState::Exhausted;
                    debug!(
                        chars = self.assembler.content().len(),
                        finish_reason = ?self.assembler.finish_reason(),
                        "Streaming reply exhausted"
                    );
                    return self.lines.flush().map(Ok);
                }
                Ok(Some(Err(err))) | Err(err) => return Some(Err(self.fail(err))),
            };

            match self.assembler.push(&fragment) {
                Ok(Some(chunk)) => {
                    if let Some(line) = self.lines.push(chunk) {
                        return Some(Ok(line));
                    }
                }
                Ok(None) => {}
                Err(err) => return Some(Err(self.fail(err))),
            }
        }
    }

    /// Drain the stream and return the assembled outcome.
    ///
    /// # Errors
    /// Returns the stream's error, or `Transport` if an earlier call to
    /// `next_line` already failed.
    pub async fn finish(mut self) -> ChatResult<StreamOutcome> {
        while let Some(line) = self.next_line().await {
            line?;
        }
        if self.state == ReplyState::Failed {
            return Err(ChatError::Transport(
                "streaming reply failed before completion".to_string(),
            ));
        }
        Ok(StreamOutcome {
            final_message: self.assembler.finish(),
            appended_user_turn: self.appended_user_turn,
        })
    }

    fn fail(&mut self, err: ChatError) -> ChatError {
        self.state = ReplyState::Failed;
        debug!(error = %err, "Streaming reply failed");
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn reply(fragments: Vec<ChatResult<DeltaFragment>>) -> StreamingReply {
        StreamingReply::new(
            Box::pin(stream::iter(fragments)),
            ChatMessage::user("prompt"),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
    }

    async fn collect_lines(reply: &mut StreamingReply) -> Vec<ChatResult<String>> {
        let mut lines = Vec::new();
        while let Some(line) = reply.next_line().await {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_assembler_concatenates_in_order() {
        let mut assembler = MessageAssembler::new();
        let fragments = [
            DeltaFragment::role(Role::Assistant),
            DeltaFragment::content("Hel"),
            DeltaFragment::content("lo"),
            DeltaFragment::finish("stop"),
        ];
        for fragment in &fragments {
            assembler.push(fragment).unwrap();
        }
        assert_eq!(assembler.finish_reason(), Some("stop"));
        assert_eq!(assembler.finish(), ChatMessage::assistant("Hello"));
    }

    #[test]
    fn test_assembler_rejects_empty_fragment() {
        let mut assembler = MessageAssembler::new();
        let err = assembler.push(&DeltaFragment::default()).unwrap_err();
        assert!(matches!(err, ChatError::Transport(_)));
    }

    #[test]
    fn test_assembler_role_rules() {
        let mut assembler = MessageAssembler::new();
        assembler.push(&DeltaFragment::role(Role::Assistant)).unwrap();
        assembler.push(&DeltaFragment::role(Role::Assistant)).unwrap();
        assert!(assembler.push(&DeltaFragment::role(Role::User)).is_err());

        let mut roleless = MessageAssembler::new();
        roleless.push(&DeltaFragment::content("hi")).unwrap();
        assert_eq!(roleless.finish().role, Role::Assistant);
    }

    #[test]
    fn test_line_buffer_emits_on_newline() {
        let mut lines = LineBuffer::new();
        assert_eq!(lines.push("Hello"), None);
        assert_eq!(lines.push(" world\n"), Some("Hello world\n".to_string()));
        assert_eq!(lines.push("a\nb"), Some("a\nb".to_string()));
        assert_eq!(lines.push("tail"), None);
        assert_eq!(lines.flush(), Some("tail".to_string()));
        assert_eq!(lines.flush(), None);
    }

    #[tokio::test]
    async fn test_reply_flushes_trailing_partial() {
        let mut reply = reply(vec![
            Ok(DeltaFragment::role(Role::Assistant)),
            Ok(DeltaFragment::content("line one\n")),
            Ok(DeltaFragment::content("line ")),
            Ok(DeltaFragment::content("two")),
            Ok(DeltaFragment::finish("stop")),
        ]);

        let lines: Vec<String> = collect_lines(&mut reply)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(lines, vec!["line one\n", "line two"]);
        assert!(reply.is_exhausted());
        assert!(reply.next_line().await.is_none());

        let outcome = reply.finish().await.unwrap();
        assert_eq!(
            outcome.final_message,
            ChatMessage::assistant("line one\nline two")
        );
        assert_eq!(outcome.appended_user_turn, ChatMessage::user("prompt"));
    }

    #[tokio::test]
    async fn test_reply_stops_at_malformed_fragment() {
        let mut reply = reply(vec![
            Ok(DeltaFragment::content("partial\n")),
            Ok(DeltaFragment::default()),
            Ok(DeltaFragment::content("never seen\n")),
        ]);

        let lines = collect_lines(&mut reply).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].as_deref().unwrap(), "partial\n");
        assert!(matches!(lines[1], Err(ChatError::Transport(_))));
        assert!(reply.finish().await.is_err());
    }

    #[tokio::test]
    async fn test_reply_finish_propagates_stream_error() {
        let reply = reply(vec![
            Ok(DeltaFragment::content("a")),
            Err(ChatError::Transport("connection reset".to_string())),
        ]);
        assert!(matches!(
            reply.finish().await,
            Err(ChatError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_reply_idle_timeout() {
        let fragments = stream::iter(vec![Ok::<_, ChatError>(DeltaFragment::content("a"))])
            .chain(stream::pending());
        let mut reply = StreamingReply::new(
            Box::pin(fragments),
            ChatMessage::user("prompt"),
            Duration::from_millis(20),
            CancellationToken::new(),
        );
        assert!(matches!(
            reply.next_line().await,
            Some(Err(ChatError::Timeout(_)))
        ));
        assert!(reply.next_line().await.is_none());
    }

    #[tokio::test]
    async fn test_reply_cancellation() {
        let cancel = CancellationToken::new();
        let mut reply = StreamingReply::new(
            Box::pin(stream::pending::<ChatResult<DeltaFragment>>()),
            ChatMessage::user("prompt"),
            Duration::from_secs(60),
            cancel.clone(),
        );
        cancel.cancel();
        assert!(matches!(
            reply.next_line().await,
            Some(Err(ChatError::Cancelled))
        ));
    }
}
