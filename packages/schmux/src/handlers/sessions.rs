use axum::{
    Json,
    extract::{Path, State},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::SchmuxError;
use crate::models::QuickLaunchEntry;
use crate::session::{SpawnRequest, TargetSpec};
use crate::ws::build_snapshot;

/// GET /api/sessions
pub async fn list_sessions(State(state): State<AppState>) -> Response {
    let snapshot = build_snapshot(
        &state.store.snapshot().await,
        state.sync.all_states().await,
    );
    Json(snapshot).into_response()
}

#[derive(Debug, Deserialize)]
pub struct SpawnBody {
    pub repo: String,
    pub branch: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub quick_launch_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SpawnResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One launch to perform, resolved from the request body.
struct SpawnItem {
    target: TargetSpec,
    prompt: Option<String>,
    display: String,
}

/// POST /api/spawn
///
/// Spawns one session per resolved item (a quick-launch name may expand to
/// several); failures are reported per item rather than failing the batch.
pub async fn spawn(State(state): State<AppState>, Json(body): Json<SpawnBody>) -> Response {
    if body.repo.trim().is_empty() || body.branch.trim().is_empty() {
        return SchmuxError::Validation("repo and branch are required".into()).into_response();
    }

    let items = match resolve_items(&state, &body).await {
        Ok(items) => items,
        Err(e) => return e.into_response(),
    };

    let mut results = Vec::with_capacity(items.len());
    for item in items {
        let request = SpawnRequest {
            repo: body.repo.clone(),
            branch: body.branch.clone(),
            target: item.target,
            prompt: item.prompt,
            nickname: body.nickname.clone(),
            workspace_id: body.workspace_id.clone(),
        };
        match state.supervisor.spawn(request).await {
            Ok(session) => results.push(SpawnResult {
                session_id: Some(session.id),
                workspace_id: Some(session.workspace_id),
                target: session.target,
                error: None,
            }),
            Err(e) => results.push(SpawnResult {
                session_id: None,
                workspace_id: None,
                target: item.display,
                error: Some(e.to_string()),
            }),
        }
    }
    Json(results).into_response()
}

async fn resolve_items(
    state: &AppState,
    body: &SpawnBody,
) -> Result<Vec<SpawnItem>, SchmuxError> {
    match (&body.quick_launch_name, &body.target, &body.command) {
        (Some(name), None, None) => {
            let entries = quick_launch_entries(state, body).await;
            let matched: Vec<SpawnItem> = entries
                .into_iter()
                .filter(|e| &e.name == name)
                .map(|e| SpawnItem {
                    display: e.target.clone(),
                    target: TargetSpec::Named(e.target),
                    prompt: e.prompt,
                })
                .collect();
            if matched.is_empty() {
                return Err(SchmuxError::NotFound(format!(
                    "quick launch {name} not found"
                )));
            }
            Ok(matched)
        }
        (None, Some(target), None) => Ok(vec![SpawnItem {
            display: target.clone(),
            target: TargetSpec::Named(target.clone()),
            prompt: body.prompt.clone(),
        }]),
        // Prompt passes through so the supervisor can reject it: ad-hoc
        // commands do not take one.
        (None, None, Some(command)) => Ok(vec![SpawnItem {
            display: "command".to_string(),
            target: TargetSpec::Adhoc(command.clone()),
            prompt: body.prompt.clone(),
        }]),
        _ => Err(SchmuxError::Validation(
            "exactly one of target, command, or quick_launch_name is required".into(),
        )),
    }
}

/// Workspace-scoped quick-launch entries take precedence over global ones.
async fn quick_launch_entries(state: &AppState, body: &SpawnBody) -> Vec<QuickLaunchEntry> {
    let workspace = match &body.workspace_id {
        Some(id) => state.store.get_workspace(id).await,
        None => state.store.find_workspace(&body.repo, &body.branch).await,
    };
    if let Some(config) = workspace.and_then(|w| w.ws_config) {
        if !config.quick_launch.is_empty() {
            return config.quick_launch;
        }
    }
    state.config.read().await.quick_launch.clone()
}

/// POST /api/dispose/{id}
pub async fn dispose(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if id.trim().is_empty() {
        return SchmuxError::Validation("missing session id".into()).into_response();
    }
    match state.supervisor.dispose(&id).await {
        Ok(()) => Json(serde_json::json!({"disposed": id})).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/dispose-workspace/{id}
pub async fn dispose_workspace(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.supervisor.dispose_workspace(&id).await {
        Ok(()) => Json(serde_json::json!({"disposed": id})).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct NicknameBody {
    pub nickname: String,
}

/// PUT /api/sessions-nickname/{id}
pub async fn set_nickname(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<NicknameBody>,
) -> Response {
    if body.nickname.trim().is_empty() {
        return SchmuxError::Validation("nickname must not be empty".into()).into_response();
    }
    match state.supervisor.rename(&id, body.nickname.trim()).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => e.into_response(),
    }
}
