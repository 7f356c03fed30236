//! OpenAI-compatible chat completions backend.

use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use reqwest_eventsource::{Error as EventSourceError, Event, EventSource, RequestBuilderExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use url::Url;

use crate::chat::core::config::LlmConfig;
use crate::chat::core::errors::{ChatError, ChatResult};
use crate::chat::core::message::{ChatMessage, Role};
use crate::llm::backend::{CompletionBackend, CompletionFuture, FragmentStream};
use crate::llm::request::{CompletionRequest, DeltaFragment};

const CHAT_COMPLETIONS_PATH: &str = "chat/completions";
const DONE_MARKER: &str = "[DONE]";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const FRAGMENT_CHANNEL_CAPACITY: usize = 32;

/// Backend talking to `{base_url}/chat/completions` with bearer auth.
#[derive(Clone, Debug)]
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    endpoint: Url,
    request_timeout: Duration,
}

impl OpenAiBackend {
    /// Build a backend from the model configuration.
    ///
    /// # Errors
    /// Returns an error if the API key is missing, the base URL is invalid,
    /// or the HTTP client cannot be built.
    pub fn new(config: &LlmConfig) -> ChatResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ChatError::InvalidConfig("missing API key".to_string()))?;
        let endpoint = Url::parse(&format!(
            "{}/{CHAT_COMPLETIONS_PATH}",
            config.base_url.trim_end_matches('/')
        ))?;
        // Body reads are unbounded so long streams survive; batch calls set
        // their own deadline per request.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            api_key,
            endpoint,
            request_timeout: config.request_timeout(),
        })
    }

    /// Endpoint the backend posts to.
    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn post(&self, request: &CompletionRequest) -> reqwest::RequestBuilder {
        self.client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(request)
    }

    async fn complete_inner(&self, mut request: CompletionRequest) -> ChatResult<ChatMessage> {
        request.stream = false;
        let response = self
            .post(&request)
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response).await);
        }

        let body: CompletionResponse = response.json().await?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::Transport("response carried no choices".to_string()))?;

        Ok(ChatMessage::new(
            choice.message.role.unwrap_or(Role::Assistant),
            choice.message.content.unwrap_or_default(),
        ))
    }

    async fn stream_inner(&self, mut request: CompletionRequest) -> ChatResult<FragmentStream> {
        request.stream = true;
        let mut source = self
            .post(&request)
            .eventsource()
            .map_err(|err| ChatError::Transport(err.to_string()))?;

        // Surface status errors from the call itself rather than mid-stream.
        match source.next().await {
            Some(Ok(Event::Open)) => {}
            Some(Ok(Event::Message(_))) => {
                source.close();
                return Err(ChatError::Transport(
                    "event stream sent data before opening".to_string(),
                ));
            }
            Some(Err(err)) => {
                source.close();
                return Err(event_error(err).await);
            }
            None => {
                return Err(ChatError::Transport(
                    "event stream closed before opening".to_string(),
                ));
            }
        }

        let (tx, rx) = mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);
        tokio::spawn(pump_fragments(source, tx));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

impl CompletionBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn complete(&self, request: CompletionRequest) -> CompletionFuture<'_, ChatResult<ChatMessage>> {
        Box::pin(self.complete_inner(request))
    }

    fn stream(&self, request: CompletionRequest) -> CompletionFuture<'_, ChatResult<FragmentStream>> {
        Box::pin(self.stream_inner(request))
    }
}

/// Forward decoded fragments until `[DONE]`, an error, or the receiver goes away.
///
/// A body that ends before `[DONE]` is an interrupted reply and ends the
/// stream with a `Transport` error.
async fn pump_fragments(mut source: EventSource, tx: mpsc::Sender<ChatResult<DeltaFragment>>) {
    loop {
        let event = tokio::select! {
            () = tx.closed() => {
                debug!("Fragment receiver dropped, closing event stream");
                break;
            }
            event = source.next() => event,
        };

        let outcome = match event {
            None | Some(Err(EventSourceError::StreamEnded)) => Err(ChatError::Transport(
                "stream ended before [DONE]".to_string(),
            )),
            Some(Ok(Event::Open)) => continue,
            Some(Ok(Event::Message(message))) if message.data.trim() == DONE_MARKER => break,
            Some(Ok(Event::Message(message))) => match decode_fragment(&message.data) {
                Ok(Some(fragment)) => Ok(fragment),
                // Choice-less chunks: filter preambles, usage reports.
                Ok(None) => continue,
                Err(err) => Err(err),
            },
            Some(Err(err)) => Err(event_error(err).await),
        };

        let failed = outcome.is_err();
        if tx.send(outcome).await.is_err() || failed {
            break;
        }
    }
    source.close();
}

/// Decode one `data:` payload; `None` when the chunk carries no choice.
fn decode_fragment(data: &str) -> ChatResult<Option<DeltaFragment>> {
    let chunk: CompletionChunk = serde_json::from_str(data)
        .map_err(|err| ChatError::Transport(format!("undecodable fragment: {err}")))?;
    Ok(chunk.choices.into_iter().next().map(|choice| DeltaFragment {
        role: choice.delta.role,
        content: choice.delta.content,
        finish_reason: choice.finish_reason,
    }))
}

async fn event_error(err: EventSourceError) -> ChatError {
    match err {
        EventSourceError::InvalidStatusCode(status, response) => {
            status_error(status, response).await
        }
        EventSourceError::Transport(err) => ChatError::Http(err),
        other => ChatError::Transport(other.to_string()),
    }
}

async fn status_error(status: StatusCode, response: reqwest::Response) -> ChatError {
    let body = match response.text().await {
        Ok(body) => body,
        Err(err) => {
            warn!(error = %err, "Failed to read error body");
            String::new()
        }
    };
    let message = serde_json::from_str::<ErrorEnvelope>(&body)
        .map(|envelope| envelope.error.message)
        .unwrap_or(body);

    ChatError::HttpStatus {
        status: status.as_u16(),
        body: message,
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    role: Option<Role>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    role: Option<Role>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    fn backend(server: &MockServer) -> OpenAiBackend {
        let config = LlmConfig {
            api_key: Some("test-key".to_string()),
            base_url: server.url("/v1"),
            ..LlmConfig::default()
        };
        OpenAiBackend::new(&config).unwrap()
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(
            &LlmConfig::default(),
            vec![ChatMessage::user("Say hello")],
            false,
        )
    }

    #[test]
    fn test_new_requires_api_key() {
        let config = LlmConfig {
            api_key: Some("  ".to_string()),
            ..LlmConfig::default()
        };
        assert!(matches!(
            OpenAiBackend::new(&config),
            Err(ChatError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let config = LlmConfig {
            api_key: Some("k".to_string()),
            base_url: "https://api.example.com/v1/".to_string(),
            ..LlmConfig::default()
        };
        let backend = OpenAiBackend::new(&config).unwrap();
        assert_eq!(
            backend.endpoint().as_str(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_decode_fragment_shapes() {
        let role = decode_fragment(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap();
        assert_eq!(role, Some(DeltaFragment::role(Role::Assistant)));

        let content = decode_fragment(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#).unwrap();
        assert_eq!(content, Some(DeltaFragment::content("Hi")));

        let finish =
            decode_fragment(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#).unwrap();
        assert_eq!(finish, Some(DeltaFragment::finish("stop")));

        assert_eq!(decode_fragment(r#"{"choices":[]}"#).unwrap(), None);
        assert_eq!(
            decode_fragment(r#"{"choices":[],"usage":{"total_tokens":9}}"#).unwrap(),
            None
        );
        let bare = decode_fragment(r#"{"choices":[{"delta":{}}]}"#).unwrap();
        assert!(bare.is_some_and(|fragment| fragment.is_empty()));
        assert!(matches!(
            decode_fragment("not json"),
            Err(ChatError::Transport(_))
        ));
    }

    async fn serve_sse(server: &MockServer, sse: &'static str) {
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(sse);
            })
            .await;
    }

    #[tokio::test]
    async fn test_stream_without_done_marker_is_interrupted() {
        let server = MockServer::start_async().await;
        serve_sse(
            &server,
            concat!(
                "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
                "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"The answer is\"}}]}\n\n"
            ),
        )
        .await;

        let items: Vec<ChatResult<DeltaFragment>> =
            backend(&server).stream(request()).await.unwrap().collect().await;

        assert_eq!(items.len(), 3);
        assert!(matches!(items[1], Ok(ref f) if f == &DeltaFragment::content("The answer is")));
        assert!(matches!(items[2], Err(ChatError::Transport(ref msg)) if msg.contains("[DONE]")));
    }

    #[tokio::test]
    async fn test_stream_skips_choiceless_chunks() {
        let server = MockServer::start_async().await;
        serve_sse(
            &server,
            concat!(
                "data: {\"choices\":[],\"prompt_filter_results\":[{\"prompt_index\":0}]}\n\n",
                "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hi\"}}]}\n\n",
                "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
                "data: {\"choices\":[],\"usage\":{\"total_tokens\":12}}\n\n",
                "data: [DONE]\n\n"
            ),
        )
        .await;

        let fragments: Vec<DeltaFragment> = backend(&server)
            .stream(request())
            .await
            .unwrap()
            .map(|fragment| fragment.unwrap())
            .collect()
            .await;

        assert_eq!(
            fragments,
            vec![
                DeltaFragment {
                    role: Some(Role::Assistant),
                    content: Some("Hi".to_string()),
                    finish_reason: None,
                },
                DeltaFragment::finish("stop"),
            ]
        );
    }

    #[tokio::test]
    async fn test_complete_reads_first_choice() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("authorization", "Bearer test-key")
                    .body_contains("\"stream\":false")
                    .body_contains("Say hello");
                then.status(200).json_body(json!({
                    "id": "chatcmpl-1",
                    "object": "chat.completion",
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": "Hello there"},
                        "finish_reason": "stop"
                    }]
                }));
            })
            .await;

        let reply = backend(&server).complete(request()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(reply, ChatMessage::assistant("Hello there"));
    }

    #[tokio::test]
    async fn test_complete_surfaces_vendor_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(429)
                    .json_body(json!({"error": {"message": "Rate limit exceeded"}}));
            })
            .await;

        let err = backend(&server).complete(request()).await.unwrap_err();

        assert!(err.is_retryable());
        match err {
            ChatError::HttpStatus { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, "Rate limit exceeded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_decodes_event_stream() {
        let server = MockServer::start_async().await;
        let sse = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\\n\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n"
        );
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .body_contains("\"stream\":true");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(sse);
            })
            .await;

        let stream = backend(&server).stream(request()).await.unwrap();
        let fragments: Vec<DeltaFragment> = stream
            .map(|fragment| fragment.unwrap())
            .collect()
            .await;

        mock.assert_async().await;
        assert_eq!(
            fragments,
            vec![
                DeltaFragment::role(Role::Assistant),
                DeltaFragment::content("Hel"),
                DeltaFragment::content("lo\n"),
                DeltaFragment::finish("stop"),
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_open_failure_is_status_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(401)
                    .json_body(json!({"error": {"message": "Incorrect API key"}}));
            })
            .await;

        let err = backend(&server).stream(request()).await.err().unwrap();

        assert!(matches!(
            err,
            ChatError::HttpStatus { status: 401, ref body } if body == "Incorrect API key"
        ));
    }

    #[tokio::test]
    async fn test_stream_malformed_fragment_ends_with_transport_error() {
        let server = MockServer::start_async().await;
        let sse = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ok\"}}]}\n\n",
            "data: {broken\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"late\"}}]}\n\n"
        );
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(sse);
            })
            .await;

        let items: Vec<ChatResult<DeltaFragment>> =
            backend(&server).stream(request()).await.unwrap().collect().await;

        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Ok(ref f) if f == &DeltaFragment::content("ok")));
        assert!(matches!(items[1], Err(ChatError::Transport(_))));
    }
}
