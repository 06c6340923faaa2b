use axum::{
    Json,
    extract::State,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::AppState;

/// GET /api/prs
pub async fn list_prs(State(state): State<AppState>) -> Response {
    Json(state.prs.list().await).into_response()
}

/// POST /api/prs/refresh
pub async fn refresh_prs(State(state): State<AppState>) -> Response {
    match state.prs.refresh().await {
        Ok(prs) => Json(prs).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckoutBody {
    pub repo_url: String,
    pub number: u64,
}

/// POST /api/prs/checkout
pub async fn checkout_pr(State(state): State<AppState>, Json(body): Json<CheckoutBody>) -> Response {
    match state.prs.checkout(&body.repo_url, body.number).await {
        Ok(workspace) => Json(workspace).into_response(),
        Err(e) => e.into_response(),
    }
}
