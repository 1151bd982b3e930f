use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/model/status", get(get_model_status))
}

/// Lets clients warn the user before the first turn when no key is set.
#[tracing::instrument(level = "debug", skip_all)]
async fn get_model_status(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "configured": state.llm_configured,
        "model": state.model,
        "base_url": state.base_url,
    }))
}
