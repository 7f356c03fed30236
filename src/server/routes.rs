//! HTTP route handlers for the chatbot API.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};

use crate::chat::core::errors::ChatError;
use crate::chat::core::message::ConversationRecord;

use super::state::AppState;

const NDJSON: &str = "application/x-ndjson";
const LINE_CHANNEL_CAPACITY: usize = 16;

/// Create the API router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/chat", post(chat))
        .route("/api/conversations", get(list_conversations))
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chatbot",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Chat request.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// The user's prompt.
    pub prompt: String,
}

/// One streamed partial reply.
#[derive(Debug, Serialize)]
pub struct ResponseFragment {
    /// Text completed since the previous fragment.
    pub response: String,
}

/// Error payload, as a JSON body or a final stream line.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Error description.
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(err: &ChatError) -> ApiError {
    let status = match err {
        ChatError::Validation(_) | ChatError::InvalidPattern(_) | ChatError::InvalidConfig(_) => {
            StatusCode::BAD_REQUEST
        }
        ChatError::HttpStatus { .. }
        | ChatError::Transport(_)
        | ChatError::Http(_)
        | ChatError::Timeout(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error!(error = %err, status = status.as_u16(), "Request failed");
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
}

fn json_line<T: Serialize>(value: &T) -> String {
    let mut line = serde_json::to_string(value)
        .unwrap_or_else(|err| format!("{{\"error\":\"unencodable fragment: {err}\"}}"));
    line.push('\n');
    line
}

/// Submit a prompt and stream the reply as newline-delimited JSON.
///
/// Each line is `{"response": ...}`; a failure mid-stream ends the body with
/// `{"error": ...}`. The turn is stored only if the stream completes. A
/// client that disconnects drops the turn, which aborts the remote call.
async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    if request.prompt.trim().is_empty() {
        return Err(api_error(&ChatError::Validation(
            "prompt must not be empty".to_string(),
        )));
    }

    let mut chatbot = state.chatbot.clone().lock_owned().await;
    let turn = chatbot
        .submit_turn_streaming(&request.prompt)
        .await
        .map_err(|err| api_error(&err))?;

    let (tx, rx) = mpsc::channel::<Result<String, Infallible>>(LINE_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        // Holding the guard keeps other turns out until this one is done.
        let _chatbot = chatbot;
        let mut lines = Box::pin(turn.into_lines());
        loop {
            let next = tokio::select! {
                () = tx.closed() => {
                    info!("Client disconnected, dropping streaming turn");
                    break;
                }
                next = lines.next() => next,
            };
            let line = match next {
                None => break,
                Some(Ok(text)) => json_line(&ResponseFragment { response: text }),
                Some(Err(err)) => {
                    error!(error = %err, "Streaming turn failed");
                    let _ = tx
                        .send(Ok(json_line(&ErrorBody {
                            error: err.to_string(),
                        })))
                        .await;
                    break;
                }
            };
            if tx.send(Ok(line)).await.is_err() {
                break;
            }
        }
    });

    Ok((
        [(header::CONTENT_TYPE, NDJSON)],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response())
}

/// List conversations, most recently updated first.
async fn list_conversations(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ConversationRecord>>, ApiError> {
    let chatbot = state.chatbot.lock().await;
    let conversations = chatbot
        .list_conversations()
        .await
        .map_err(|err| api_error(&err))?;
    Ok(Json(conversations))
}
