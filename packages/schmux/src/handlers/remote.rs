use axum::{
    Json,
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::AppState;
use crate::remote::ConnectOutcome;

/// Connect attempts per principal per window, enforced at the API edge (not
/// inside the manager).
const CONNECT_LIMIT: usize = 3;
const CONNECT_WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    max: usize,
    window: Duration,
    hits: Mutex<HashMap<String, Vec<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(CONNECT_LIMIT, CONNECT_WINDOW)
    }
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt for `key`; false when the key is over its budget.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap();
        let entry = hits.entry(key.to_string()).or_default();
        entry.retain(|at| now.duration_since(*at) < self.window);
        if entry.len() >= self.max {
            return false;
        }
        entry.push(now);
        true
    }
}

/// GET /api/remote/hosts
pub async fn list_hosts(State(state): State<AppState>) -> Response {
    Json(state.store.list_remote_hosts().await).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ConnectBody {
    pub flavor_id: String,
}

/// POST /api/remote/hosts/connect
///
/// 202 with the provisioning session id; the UI bridges it over
/// `/ws/provision/{id}` and watches status on the session-list channel.
pub async fn connect(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<ConnectBody>,
) -> Response {
    if state.config.read().await.remote_flavors.is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "remote hosts are not configured"})),
        )
            .into_response();
    }
    if !state.rate_limiter.allow(&addr.ip().to_string()) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({"error": "too many connect attempts"})),
        )
            .into_response();
    }

    match state.remotes.start_connect(&body.flavor_id).await {
        Ok(ConnectOutcome::Started {
            host,
            provisioning_session_id,
        }) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "host": host,
                "provisioning_session_id": provisioning_session_id,
            })),
        )
            .into_response(),
        Ok(ConnectOutcome::AlreadyConnected(host)) => {
            Json(serde_json::json!({"host": host})).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// POST /api/remote/hosts/{id}/reconnect
pub async fn reconnect(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Response {
    if !state.rate_limiter.allow(&addr.ip().to_string()) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({"error": "too many connect attempts"})),
        )
            .into_response();
    }
    match state.remotes.start_reconnect(&id).await {
        Ok(provisioning_session_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "provisioning_session_id": provisioning_session_id,
            })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// DELETE /api/remote/hosts/{id}
pub async fn disconnect(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.remotes.disconnect(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}
