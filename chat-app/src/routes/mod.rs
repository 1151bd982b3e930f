pub mod conversations;
pub mod health;
pub mod model;
pub mod tasks;

use axum::Router;
use axum::http::StatusCode;
use axum::Json;
use chat_llm::ConversationId;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(model::router())
        .merge(conversations::router())
        .merge(tasks::router())
}

pub(crate) type ErrorResponse = (StatusCode, Json<serde_json::Value>);

pub(crate) fn error_response(status: StatusCode, error: impl std::fmt::Display) -> ErrorResponse {
    (
        status,
        Json(serde_json::json!({ "status": "error", "error": error.to_string() })),
    )
}

/// Conversation ids are path segments chosen by clients.
pub(crate) fn parse_conversation_id(raw: &str) -> Result<ConversationId, ErrorResponse> {
    let valid = !raw.is_empty()
        && raw.len() <= 128
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(ConversationId::new(raw))
    } else {
        Err(error_response(StatusCode::BAD_REQUEST, "invalid conversation id"))
    }
}
