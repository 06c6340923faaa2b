use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::info;

use crate::AppState;
use crate::config::{Config, RemoteFlavor, save_config};
use crate::error::SchmuxError;

/// GET /api/config
pub async fn get_config(State(state): State<AppState>) -> Response {
    Json(state.config.read().await.clone()).into_response()
}

/// POST /api/config
///
/// Validates, persists, and swaps the in-memory config. Run targets and
/// flavors are reloaded; live sessions keep the recipe they were spawned
/// with.
pub async fn set_config(State(state): State<AppState>, Json(new): Json<Config>) -> Response {
    if let Err(e) = new.validate() {
        return e.into_response();
    }
    if let Err(e) = save_config(&state.dirs.config_path, &new) {
        return SchmuxError::Fatal(format!("saving config: {e}")).into_response();
    }
    *state.config.write().await = new.clone();
    info!("configuration reloaded");
    Json(new).into_response()
}

/// GET /api/config/remote-flavors
pub async fn list_flavors(State(state): State<AppState>) -> Response {
    Json(state.config.read().await.remote_flavors.clone()).into_response()
}

/// POST /api/config/remote-flavors
pub async fn add_flavor(State(state): State<AppState>, Json(flavor): Json<RemoteFlavor>) -> Response {
    let mut config = state.config.read().await.clone();
    if config.flavor(&flavor.id).is_some() {
        return SchmuxError::Conflict(format!("flavor {} already exists", flavor.id))
            .into_response();
    }
    config.remote_flavors.push(flavor.clone());
    persist_and_swap(&state, config, || {
        (StatusCode::CREATED, Json(flavor)).into_response()
    })
    .await
}

/// PUT /api/config/remote-flavors/{id}
pub async fn update_flavor(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(flavor): Json<RemoteFlavor>,
) -> Response {
    if flavor.id != id {
        return SchmuxError::Validation("flavor id in body must match path".into())
            .into_response();
    }
    let mut config = state.config.read().await.clone();
    let Some(slot) = config.remote_flavors.iter_mut().find(|f| f.id == id) else {
        return SchmuxError::NotFound(format!("flavor {id} not found")).into_response();
    };
    *slot = flavor.clone();
    persist_and_swap(&state, config, || Json(flavor).into_response()).await
}

/// DELETE /api/config/remote-flavors/{id}
pub async fn remove_flavor(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let in_use = state
        .store
        .list_remote_hosts()
        .await
        .iter()
        .any(|h| h.flavor_id == id && h.status.is_usable());
    if in_use {
        return SchmuxError::Conflict(format!("flavor {id} has a connected host"))
            .into_response();
    }

    let mut config = state.config.read().await.clone();
    let before = config.remote_flavors.len();
    config.remote_flavors.retain(|f| f.id != id);
    if config.remote_flavors.len() == before {
        return SchmuxError::NotFound(format!("flavor {id} not found")).into_response();
    }
    persist_and_swap(&state, config, || StatusCode::NO_CONTENT.into_response()).await
}

async fn persist_and_swap(
    state: &AppState,
    config: Config,
    ok: impl FnOnce() -> Response,
) -> Response {
    if let Err(e) = config.validate() {
        return e.into_response();
    }
    if let Err(e) = save_config(&state.dirs.config_path, &config) {
        return SchmuxError::Fatal(format!("saving config: {e}")).into_response();
    }
    *state.config.write().await = config;
    ok()
}
