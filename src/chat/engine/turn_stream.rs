//! Streaming turn handle.

use futures::Stream;
use futures::stream;
use tokio_util::sync::CancellationToken;

use crate::chat::core::errors::ChatResult;
use crate::chat::engine::chatbot::TurnRecorder;
use crate::llm::stream::{StreamOutcome, StreamingReply};

/// A turn whose reply is still arriving.
///
/// Lines are yielded as they complete. The turn is stored only after the
/// reply ends cleanly; dropping the handle early or hitting an error stores
/// nothing.
pub struct TurnStream {
    reply: StreamingReply,
    recorder: TurnRecorder,
}

impl TurnStream {
    pub(crate) const fn new(reply: StreamingReply, recorder: TurnRecorder) -> Self {
        Self { reply, recorder }
    }

    /// Token that aborts the in-flight reply.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.reply.cancel_token()
    }

    /// Next partial line, or `None` when the reply has ended.
    pub async fn next_line(&mut self) -> Option<ChatResult<String>> {
        self.reply.next_line().await
    }

    /// Drain the reply, then persist the turn.
    ///
    /// # Errors
    /// Returns the stream error, if any, before touching the store; otherwise
    /// any storage error.
    pub async fn finish(self) -> ChatResult<StreamOutcome> {
        let outcome = self.reply.finish().await?;
        self.recorder
            .record(outcome.appended_user_turn.clone(), &outcome.final_message)
            .await?;
        Ok(outcome)
    }

    /// Consume the turn as a stream of lines.
    ///
    /// Persistence happens when the stream is polled past its last line; a
    /// storage failure at that point is yielded as a final error.
    pub fn into_lines(self) -> impl Stream<Item = ChatResult<String>> + Send {
        stream::unfold(Some(self), |state| async move {
            let mut turn = state?;
            match turn.next_line().await {
                Some(Ok(line)) => Some((Ok(line), Some(turn))),
                Some(Err(err)) => Some((Err(err), None)),
                None => match turn.finish().await {
                    Ok(_) => None,
                    Err(err) => Some((Err(err), None)),
                },
            }
        })
    }
}
