use axum::{
    Json,
    extract::{Query, Request, State},
    http::{HeaderMap, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::AppState;
use crate::config::AccessControlConfig;

const COOKIE_NAME: &str = "schmux_session";
const CSRF_HEADER: &str = "x-schmux-csrf";
const SESSION_TTL_HOURS: i64 = 24 * 7;

type HmacSha256 = Hmac<Sha256>;

/// Signed-cookie session auth with GitHub OAuth, enforced at the HTTP edge
/// only. With no `access_control` configured the server runs open (local
/// mode).
pub struct AuthService {
    access: Option<AccessControlConfig>,
    key: [u8; 32],
    client: reqwest::Client,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionToken {
    pub login: String,
    pub csrf: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthService {
    /// The signing key is persisted under the data dir so sessions survive
    /// restarts.
    pub fn new(access: Option<AccessControlConfig>, data_dir: &Path) -> anyhow::Result<Self> {
        let key_path = data_dir.join("auth.key");
        let key: [u8; 32] = match std::fs::read(&key_path) {
            Ok(bytes) if bytes.len() == 32 => bytes.try_into().unwrap(),
            _ => {
                let mut key = [0u8; 32];
                rand::rng().fill_bytes(&mut key);
                std::fs::write(&key_path, key)?;
                key
            }
        };
        Ok(Self {
            access,
            key,
            client: reqwest::Client::new(),
        })
    }

    pub fn enabled(&self) -> bool {
        self.access.is_some()
    }

    pub fn sign(&self, token: &SessionToken) -> String {
        sign_token(&self.key, token)
    }

    pub fn verify(&self, raw: &str) -> Option<SessionToken> {
        verify_token(&self.key, raw, Utc::now())
    }

    fn login_allowed(&self, login: &str) -> bool {
        match &self.access {
            None => true,
            Some(access) => {
                access.allowed_logins.is_empty()
                    || access.allowed_logins.iter().any(|l| l == login)
            }
        }
    }

    fn session_from_headers(&self, headers: &HeaderMap) -> Option<SessionToken> {
        let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
        let raw = cookies.split(';').find_map(|part| {
            let (name, value) = part.trim().split_once('=')?;
            (name == COOKIE_NAME).then(|| value.to_string())
        })?;
        self.verify(&raw)
    }
}

pub fn sign_token(key: &[u8; 32], token: &SessionToken) -> String {
    let payload = serde_json::to_vec(token).expect("token serializes");
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(&payload);
    let signature = mac.finalize().into_bytes();
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(&payload),
        URL_SAFE_NO_PAD.encode(signature)
    )
}

pub fn verify_token(key: &[u8; 32], raw: &str, now: DateTime<Utc>) -> Option<SessionToken> {
    let (payload_b64, signature_b64) = raw.split_once('.')?;
    let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
    let signature = URL_SAFE_NO_PAD.decode(signature_b64).ok()?;

    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    mac.update(&payload);
    mac.verify_slice(&signature).ok()?;

    let token: SessionToken = serde_json::from_slice(&payload).ok()?;
    (token.expires_at > now).then_some(token)
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

fn session_cookie(value: &str, clear: bool) -> String {
    if clear {
        format!("{COOKIE_NAME}=; HttpOnly; Path=/; SameSite=Lax; Max-Age=0")
    } else {
        format!("{COOKIE_NAME}={value}; HttpOnly; Path=/; SameSite=Lax")
    }
}

// =============================================================================
// Middleware
// =============================================================================

/// Auth + CSRF gate for `/api` routes. State-changing methods must echo the
/// session's CSRF token in `x-schmux-csrf`.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let auth = &state.auth;
    if !auth.enabled() {
        return next.run(request).await;
    }

    let Some(session) = auth.session_from_headers(request.headers()) else {
        return crate::error::SchmuxError::Unauthorized.into_response();
    };

    let method = request.method();
    let mutating = !(method == Method::GET || method == Method::HEAD || method == Method::OPTIONS);
    if mutating {
        let sent = request
            .headers()
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok());
        if sent != Some(session.csrf.as_str()) {
            return crate::error::SchmuxError::Forbidden.into_response();
        }
    }

    next.run(request).await
}

// =============================================================================
// OAuth handlers
// =============================================================================

#[derive(Deserialize)]
pub struct CallbackQuery {
    code: String,
}

/// GET /auth/login
pub async fn login(State(state): State<AppState>) -> Response {
    let Some(access) = &state.auth.access else {
        return Json(serde_json::json!({"enabled": false})).into_response();
    };
    let url = format!(
        "https://github.com/login/oauth/authorize?client_id={}&scope=read:user",
        access.github_oauth.client_id
    );
    Redirect::temporary(&url).into_response()
}

/// GET /auth/callback
pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let auth: &Arc<AuthService> = &state.auth;
    let Some(access) = &auth.access else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let login = match exchange_code(&auth.client, access, &query.code).await {
        Ok(login) => login,
        Err(e) => {
            warn!("OAuth exchange failed: {e}");
            return crate::error::SchmuxError::Unauthorized.into_response();
        }
    };
    if !auth.login_allowed(&login) {
        info!("login {login} not in allow-list");
        return crate::error::SchmuxError::Forbidden.into_response();
    }

    let token = SessionToken {
        login,
        csrf: random_hex(16),
        expires_at: Utc::now() + Duration::hours(SESSION_TTL_HOURS),
    };
    let cookie = session_cookie(&auth.sign(&token), false);
    (
        [(header::SET_COOKIE, cookie)],
        Redirect::temporary("/"),
    )
        .into_response()
}

/// POST /auth/logout
pub async fn logout() -> Response {
    (
        [(header::SET_COOKIE, session_cookie("", true))],
        StatusCode::NO_CONTENT,
    )
        .into_response()
}

/// GET /auth/me
pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.auth.enabled() {
        return Json(serde_json::json!({"enabled": false})).into_response();
    }
    match state.auth.session_from_headers(&headers) {
        Some(session) => Json(serde_json::json!({
            "enabled": true,
            "login": session.login,
            "csrf": session.csrf,
        }))
        .into_response(),
        None => crate::error::SchmuxError::Unauthorized.into_response(),
    }
}

async fn exchange_code(
    client: &reqwest::Client,
    access: &AccessControlConfig,
    code: &str,
) -> std::result::Result<String, String> {
    #[derive(Deserialize)]
    struct TokenReply {
        access_token: Option<String>,
    }
    let reply: TokenReply = client
        .post("https://github.com/login/oauth/access_token")
        .header(header::ACCEPT, "application/json")
        .form(&[
            ("client_id", access.github_oauth.client_id.as_str()),
            ("client_secret", access.github_oauth.client_secret.as_str()),
            ("code", code),
        ])
        .send()
        .await
        .map_err(|e| e.to_string())?
        .json()
        .await
        .map_err(|e| e.to_string())?;
    let token = reply.access_token.ok_or("no access token in reply")?;

    #[derive(Deserialize)]
    struct User {
        login: String,
    }
    let user: User = client
        .get("https://api.github.com/user")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::USER_AGENT, "schmux")
        .send()
        .await
        .map_err(|e| e.to_string())?
        .json()
        .await
        .map_err(|e| e.to_string())?;
    Ok(user.login)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; 32] {
        [7u8; 32]
    }

    fn token(expires_at: DateTime<Utc>) -> SessionToken {
        SessionToken {
            login: "alice".to_string(),
            csrf: "deadbeef".to_string(),
            expires_at,
        }
    }

    #[test]
    fn sign_verify_roundtrip() {
        let t = token(Utc::now() + Duration::hours(1));
        let raw = sign_token(&key(), &t);
        let verified = verify_token(&key(), &raw, Utc::now()).unwrap();
        assert_eq!(verified, t);
    }

    #[test]
    fn expired_token_rejected() {
        let t = token(Utc::now() - Duration::hours(1));
        let raw = sign_token(&key(), &t);
        assert!(verify_token(&key(), &raw, Utc::now()).is_none());
    }

    #[test]
    fn tampered_payload_rejected() {
        let t = token(Utc::now() + Duration::hours(1));
        let raw = sign_token(&key(), &t);
        let (payload, signature) = raw.split_once('.').unwrap();
        let forged = SessionToken {
            login: "mallory".to_string(),
            csrf: "deadbeef".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        };
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        let tampered = format!("{forged_payload}.{signature}");
        assert_ne!(payload, forged_payload);
        assert!(verify_token(&key(), &tampered, Utc::now()).is_none());
    }

    #[test]
    fn wrong_key_rejected() {
        let t = token(Utc::now() + Duration::hours(1));
        let raw = sign_token(&key(), &t);
        let other = [9u8; 32];
        assert!(verify_token(&other, &raw, Utc::now()).is_none());
    }

    #[test]
    fn garbage_rejected() {
        assert!(verify_token(&key(), "", Utc::now()).is_none());
        assert!(verify_token(&key(), "abc", Utc::now()).is_none());
        assert!(verify_token(&key(), "a.b", Utc::now()).is_none());
    }

    #[test]
    fn cookie_shapes() {
        assert!(session_cookie("tok", false).starts_with("schmux_session=tok; HttpOnly"));
        assert!(session_cookie("", true).contains("Max-Age=0"));
    }
}
