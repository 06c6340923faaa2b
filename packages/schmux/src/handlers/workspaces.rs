use axum::{
    Json,
    extract::{Path, State},
    response::{IntoResponse, Response},
};

use crate::AppState;

/// GET /api/workspaces
pub async fn list_workspaces(State(state): State<AppState>) -> Response {
    Json(state.store.list_workspaces().await).into_response()
}

/// POST /api/workspaces/scan
pub async fn scan(State(state): State<AppState>) -> Response {
    match state.workspaces.scan().await {
        Ok(delta) => Json(delta).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/diff/{id}
pub async fn diff(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.workspaces.diff(&id).await {
        Ok(files) => Json(files).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/git-graph/{id}
pub async fn git_graph(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.workspaces.git_graph(&id).await {
        Ok(nodes) => Json(nodes).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/workspaces/{id}/refresh-status
pub async fn refresh_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.workspaces.git_status(&id, true).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => e.into_response(),
    }
}
