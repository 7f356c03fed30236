//! Scripted completion backend.
//!
//! Answers from queued replies and fragment scripts, falling back to a fixed
//! reply. Every request is recorded. Serves the offline provider and tests.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::stream;
use futures::StreamExt;

use crate::chat::core::errors::ChatResult;
use crate::chat::core::message::{ChatMessage, Role};
use crate::llm::backend::{CompletionBackend, CompletionFuture, FragmentStream};
use crate::llm::request::{CompletionRequest, DeltaFragment};

/// Reply used when nothing is queued.
pub const DEFAULT_STUB_REPLY: &str = "This is an offline reply.";

struct StreamScript {
    fragments: Vec<ChatResult<DeltaFragment>>,
    stall: bool,
}

/// Completion backend with canned behaviour.
pub struct StubBackend {
    default_reply: String,
    replies: Mutex<VecDeque<ChatResult<String>>>,
    streams: Mutex<VecDeque<StreamScript>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StubBackend {
    /// Backend answering every call with `default_reply`.
    #[must_use]
    pub fn new(default_reply: impl Into<String>) -> Self {
        Self {
            default_reply: default_reply.into(),
            replies: Mutex::new(VecDeque::new()),
            streams: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue the result of the next batch call.
    pub fn push_reply(&self, reply: ChatResult<String>) {
        lock(&self.replies).push_back(reply);
    }

    /// Queue the fragments of the next streaming call.
    pub fn push_stream(&self, fragments: Vec<ChatResult<DeltaFragment>>) {
        lock(&self.streams).push_back(StreamScript {
            fragments,
            stall: false,
        });
    }

    /// Queue a streaming call that never ends after its fragments.
    pub fn push_stalled_stream(&self, fragments: Vec<ChatResult<DeltaFragment>>) {
        lock(&self.streams).push_back(StreamScript {
            fragments,
            stall: true,
        });
    }

    /// Requests received so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }

    /// Fragments a well-behaved endpoint would send for `text`.
    #[must_use]
    pub fn fragments_for(text: &str) -> Vec<ChatResult<DeltaFragment>> {
        let mut fragments = vec![Ok(DeltaFragment::role(Role::Assistant))];
        fragments.extend(
            text.split_inclusive(' ')
                .map(|chunk| Ok(DeltaFragment::content(chunk))),
        );
        fragments.push(Ok(DeltaFragment::finish("stop")));
        fragments
    }

    fn record(&self, request: CompletionRequest) {
        lock(&self.requests).push(request);
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new(DEFAULT_STUB_REPLY)
    }
}

impl CompletionBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn complete(&self, request: CompletionRequest) -> CompletionFuture<'_, ChatResult<ChatMessage>> {
        Box::pin(async move {
            self.record(request);
            let reply = lock(&self.replies)
                .pop_front()
                .unwrap_or_else(|| Ok(self.default_reply.clone()))?;
            Ok(ChatMessage::assistant(reply))
        })
    }

    fn stream(&self, request: CompletionRequest) -> CompletionFuture<'_, ChatResult<FragmentStream>> {
        Box::pin(async move {
            self.record(request);
            let script = lock(&self.streams).pop_front();
            let script = script.unwrap_or_else(|| StreamScript {
                fragments: Self::fragments_for(&self.default_reply),
                stall: false,
            });

            let fragments = stream::iter(script.fragments);
            let stream: FragmentStream = if script.stall {
                Box::pin(fragments.chain(stream::pending()))
            } else {
                Box::pin(fragments)
            };
            Ok(stream)
        })
    }
}
