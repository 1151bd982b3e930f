use crate::conversation::TurnRequest;
use crate::routes::{ErrorResponse, error_response, parse_conversation_id};
use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json};
use chat_llm::{OutputPart, Role};
use chat_tools::TaskScheduler;
use futures_util::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/conversations/{id}/connect", post(connect))
        .route("/api/v1/conversations/{id}/messages", get(list_messages))
        .route("/api/v1/conversations/{id}/turns", post(submit_turn))
        .route("/api/v1/conversations/{id}/cancel", post(cancel_turn))
        .route("/api/v1/conversations/{id}/tasks", get(list_tasks))
}

#[tracing::instrument(level = "info", skip_all)]
async fn connect(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ErrorResponse> {
    let id = parse_conversation_id(&id)?;
    let messages = state
        .agent
        .connect(&id)
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(serde_json::json!({ "status": "ok", "messages": messages })))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_messages(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ErrorResponse> {
    let id = parse_conversation_id(&id)?;
    let messages = state
        .agent
        .history(&id)
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(serde_json::json!({
        "messages": messages,
        "active_turn": state.agent.is_active(&id),
    })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn submit_turn(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<TurnRequest>,
) -> Response {
    let id = match parse_conversation_id(&id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    if req.message.role != Role::User {
        return error_response(StatusCode::BAD_REQUEST, "message.role must be user").into_response();
    }
    match state.agent.submit_turn(&id, req).await {
        Ok(rx) => Sse::new(output_events(rx))
            .keep_alive(KeepAlive::default())
            .into_response(),
        Err(e) => {
            tracing::error!(conversation_id = %id, error = %e, "turn setup failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e).into_response()
        }
    }
}

/// One SSE `data:` event per output part. Dropping the stream aborts the turn.
fn output_events(
    rx: mpsc::Receiver<OutputPart>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures_util::stream::unfold(rx, |mut rx| async move {
        let part = rx.recv().await?;
        let event = Event::default().json_data(&part).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to encode output part");
            Event::default().event("error").data(e.to_string())
        });
        Some((Ok(event), rx))
    })
}

#[tracing::instrument(level = "info", skip_all)]
async fn cancel_turn(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ErrorResponse> {
    let id = parse_conversation_id(&id)?;
    let cancelled = state.agent.cancel(&id);
    Ok(Json(serde_json::json!({
        "status": if cancelled { "ok" } else { "not_found" }
    })))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_tasks(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ErrorResponse> {
    let id = parse_conversation_id(&id)?;
    let tasks = state
        .scheduler
        .list(&id)
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(serde_json::json!({ "tasks": tasks })))
}

#[cfg(test)]
mod tests {
    use crate::config::{ChatAgentConfig, StorageBackend};
    use crate::server::{app, build_state};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chat_llm::ConversationId;
    use chat_tools::{FireSpec, TaskScheduler};
    use tower::util::ServiceExt;

    async fn test_app() -> axum::Router {
        let mut cfg = ChatAgentConfig::default();
        cfg.runtime.storage = StorageBackend::Memory;
        let state = build_state(&cfg).await.expect("state");
        app(state, &cfg.runtime)
    }

    async fn send(app: &axum::Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .expect("body");
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn connect_seeds_and_messages_returns_history() {
        let app = test_app().await;
        let (status, body) = send(&app, "POST", "/api/v1/conversations/c1/connect").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["messages"].as_array().expect("messages").len(), 1);
        assert_eq!(body["messages"][0]["role"], "assistant");

        let (status, body) = send(&app, "GET", "/api/v1/conversations/c1/messages").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["messages"].as_array().expect("messages").len(), 1);
        assert_eq!(body["active_turn"], false);
    }

    #[tokio::test]
    async fn cancel_without_active_turn_is_not_found() {
        let app = test_app().await;
        let (status, body) = send(&app, "POST", "/api/v1/conversations/c1/cancel").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "not_found");
    }

    #[tokio::test]
    async fn invalid_conversation_id_is_rejected() {
        let app = test_app().await;
        let (status, body) = send(&app, "GET", "/api/v1/conversations/a%20b/messages").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn tasks_and_health_routes_respond() {
        let app = test_app().await;
        let (status, body) = send(&app, "GET", "/api/v1/conversations/c1/tasks").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["tasks"].as_array().expect("tasks").is_empty());

        let (status, body) = send(&app, "DELETE", "/api/v1/conversations/c1/tasks/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "not_found");

        let (status, body) = send(&app, "GET", "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tools"], 5);
        assert_eq!(body["storage"], "memory");

        let (_, body) = send(&app, "GET", "/api/v1/model/status").await;
        assert_eq!(body["configured"], false);
    }

    #[tokio::test]
    async fn task_delete_is_scoped_to_its_conversation() {
        let mut cfg = ChatAgentConfig::default();
        cfg.runtime.storage = StorageBackend::Memory;
        let state = build_state(&cfg).await.expect("state");
        let task = state
            .scheduler
            .schedule(
                &ConversationId::new("alice"),
                "pay rent",
                FireSpec::Delay { seconds: 60 },
            )
            .await
            .expect("schedule");
        let app = app(state.clone(), &cfg.runtime);

        let uri = format!("/api/v1/conversations/bob/tasks/{}", task.id);
        let (status, _) = send(&app, "DELETE", &uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(state.scheduler.task_count().await, 1);

        let uri = format!("/api/v1/conversations/alice/tasks/{}", task.id);
        let (status, body) = send(&app, "DELETE", &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(state.scheduler.task_count().await, 0);
    }
}
