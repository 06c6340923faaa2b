use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::AppState;

/// POST /api/linear-sync/{id}
///
/// Long-running: returns 202 immediately; progress is observed over the
/// session-list channel. 409 while an attempt is in flight.
pub async fn start_sync(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let workspace = match state.workspaces.get(&id).await {
        Ok(workspace) => workspace,
        Err(e) => return e.into_response(),
    };
    match state.sync.start(workspace).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"workspace_id": id})),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/linear-sync/{id}
pub async fn get_sync(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.sync.get_state(&id).await {
        Some(sync_state) => Json(sync_state).into_response(),
        None => crate::error::SchmuxError::NotFound(format!("no sync state for {id}"))
            .into_response(),
    }
}

/// DELETE /api/linear-sync/{id}
pub async fn dismiss_sync(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.sync.dismiss(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}
