use axum::{Json, extract::State, response::IntoResponse, response::Response};

use crate::AppState;

/// GET /api/healthz
pub async fn health(State(_state): State<AppState>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
    }))
    .into_response()
}
