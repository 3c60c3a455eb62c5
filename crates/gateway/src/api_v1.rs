//! HTTP API v1.
//!
//! Endpoints:
//!
//! - `POST /v1/chat`                     Send a message, stream NDJSON records
//! - `GET  /v1/sessions/{id}/messages`   Stored turns of a session

use axum::{
    Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use threadloom_core::error::SessionError;
use threadloom_core::{Error, Session, SessionId, Turn, UserId};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};

use crate::SharedState;

/// Header carrying the already-authenticated caller.
pub const USER_HEADER: &str = "x-user-id";

pub const NDJSON: &str = "application/x-ndjson";

pub fn v1_router(state: SharedState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/sessions/{id}/messages", get(list_messages_handler))
        .with_state(state)
}

// ── DTOs ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: ChatMessage,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub session_id: SessionId,
    pub title: Option<String>,
    pub messages: Vec<Turn>,
}

// ── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::Config { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Session(SessionError::NotFound(_) | SessionError::AssistantNotFound(_)) => StatusCode::NOT_FOUND,
            Error::Session(SessionError::Forbidden { .. }) => StatusCode::FORBIDDEN,
            _ => {
                error!(error = %e, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

fn caller(headers: &HeaderMap) -> Result<UserId, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(UserId::from)
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, format!("missing {USER_HEADER} header")))
}

/// Load a session and check it belongs to `user`.
async fn owned_session(state: &SharedState, session_id: &SessionId, user: &UserId) -> Result<Session, ApiError> {
    let session = state
        .store
        .get_session(session_id)
        .await
        .map_err(Error::from)?
        .ok_or_else(|| Error::from(SessionError::NotFound(session_id.to_string())))?;
    if !session.is_owned_by(user) {
        return Err(Error::from(SessionError::Forbidden {
            session_id: session_id.to_string(),
            user_id: user.to_string(),
        })
        .into());
    }
    Ok(session)
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// `POST /v1/chat`: one JSON record per line, closed when the turn ends.
async fn chat_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let user = caller(&headers)?;
    if payload.message.content.trim().is_empty() {
        return Err(ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "message content is empty"));
    }

    let session_id = SessionId::from(payload.session_id);
    let session = owned_session(&state, &session_id, &user).await?;
    let ctx = session.context();
    let turn = Turn::new(&ctx, payload.message.content);
    info!(session_id = %session_id, turn_id = %turn.id, "Chat turn received");

    let records = state.orchestrator.process_turn(turn, &ctx).await?;
    let lines = ReceiverStream::new(records).map(|record| record.to_ndjson_line());

    Ok(([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(lines)).into_response())
}

/// `GET /v1/sessions/{id}/messages`: oldest first, at most `limit`.
async fn list_messages_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let user = caller(&headers)?;
    let session_id = SessionId::from(id);
    let session = owned_session(&state, &session_id, &user).await?;

    let messages = state
        .store
        .recent_turns(&session_id, query.limit)
        .await
        .map_err(Error::from)?;

    Ok(Json(MessagesResponse {
        session_id,
        title: session.title,
        messages,
    }))
}
