use crate::routes::{ErrorResponse, error_response, parse_conversation_id};
use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::delete;
use axum::{Extension, Json};
use chat_tools::{TaskId, TaskScheduler};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route(
        "/api/v1/conversations/{id}/tasks/{task_id}",
        delete(delete_task),
    )
}

#[tracing::instrument(level = "info", skip_all)]
async fn delete_task(
    Extension(state): Extension<Arc<AppState>>,
    Path((id, task_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ErrorResponse> {
    let id = parse_conversation_id(&id)?;
    let task_id = TaskId::new(task_id.trim());
    if task_id.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "invalid task id"));
    }
    match state.scheduler.cancel(&id, &task_id).await {
        Ok(true) => Ok(Json(serde_json::json!({ "status": "ok" }))),
        Ok(false) => Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "status": "not_found" })),
        )),
        Err(e) => Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }
}
