//! HTTP surface: login, logout, session status, generic proxy, health and metrics.
//!
//! Endpoints: POST /api/auth/login, POST /api/auth/logout, GET /api/auth/session,
//! ANY /api/proxy?path=..., GET /healthz, GET /readyz, GET /metrics (when enabled).
//! Relay failures become `{success: false, message, error?}` via [`RelayError`].

use crate::audit;
use crate::client;
use crate::config::Config;
use crate::cookies;
use crate::error::RelayError;
use crate::health;
use crate::login::{Confidence, LoginRelay};
use crate::metrics;
use crate::proxy::{self, ProxyRelay, ProxyRequest};
use crate::session::{self, SessionRecord, SessionStore};
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{AppendHeaders, IntoResponse, Response};
use axum::routing::{any, get, post};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Shared state for every handler.
pub struct AppState {
    pub config: Config,
    pub store: SessionStore,
    pub login: LoginRelay,
    pub proxy: ProxyRelay,
    pub started_at: Instant,
}

impl AppState {
    /// Open the configured session storage and build the legacy client and relays.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let storage = session::open_storage(&config.session)?;
        let store = SessionStore::new(storage, &config.session.key, &config.legacy.cookies.csrf);
        let client = client::build_client(&config.legacy)?;
        let login = LoginRelay::new(client.clone(), config.legacy.clone())?;
        let proxy = ProxyRelay::new(client, config.legacy.clone(), store.clone());
        Ok(Self {
            config,
            store,
            login,
            proxy,
            started_at: Instant::now(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    pub jsession_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_time: Option<chrono::DateTime<chrono::Utc>>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let metrics_enabled = state
        .config
        .global
        .metrics
        .as_ref()
        .is_some_and(|m| m.enabled);
    let mut router = Router::new()
        .route("/api/auth/login", post(login_handler))
        .route("/api/auth/logout", post(logout_handler))
        .route("/api/auth/session", get(session_handler))
        .route("/api/proxy", any(proxy_handler))
        .route("/healthz", get(health::healthz_handler))
        .route("/readyz", get(health::readyz_handler));
    if metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }
    router.with_state(state)
}

/// Run the two-step login and persist the session. Used by the HTTP handler and the CLI.
pub async fn perform_login(
    state: &AppState,
    username: &str,
    password: &str,
) -> Result<(SessionRecord, LoginResponse), RelayError> {
    if username.trim().is_empty() || password.is_empty() {
        return Err(RelayError::InvalidRequest(
            "username and password are required".to_string(),
        ));
    }
    let audit_cfg = state.config.global.audit.as_ref();
    let success = match state.login.login(username, password).await {
        Ok(s) => s,
        Err(e) => {
            audit::log_credential_access(audit_cfg, username, "failed");
            return Err(e);
        }
    };
    audit::log_credential_access(audit_cfg, username, "succeeded");
    if success.confidence == Confidence::Ambiguous {
        tracing::warn!(
            username = %username,
            "login accepted on session change alone; authentication not confirmed"
        );
    }
    tracing::info!(
        username = %username,
        session_id = %audit::mask_session_id(&success.session_id),
        "login relayed"
    );

    let record = SessionRecord {
        session_id: success.session_id.clone(),
        csrf_token: success.csrf_token.clone(),
        username: Some(username.to_string()),
        login_time: Some(chrono::Utc::now()),
    };
    state.store.set(&record).await?;
    let response = LoginResponse {
        success: true,
        message: "login successful".to_string(),
        user: Some(UserInfo {
            id: username.to_string(),
            name: username.to_string(),
            jsession_id: success.session_id,
        }),
        redirect_url: success.redirect_url,
    };
    Ok((record, response))
}

/// POST /api/auth/login: `{username, password}` → login response plus session/CSRF cookies.
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(p) => p,
        Err(e) => return RelayError::InvalidRequest(e.body_text()).into_response(),
    };
    match perform_login(&state, &request.username, &request.password).await {
        Ok((record, body)) => {
            let names = &state.config.legacy.cookies;
            let set_cookies = AppendHeaders([
                (
                    SET_COOKIE,
                    cookies::browser_cookie(&names.session, &record.session_id, true),
                ),
                (
                    SET_COOKIE,
                    cookies::browser_cookie(&names.csrf, &record.csrf_token, false),
                ),
            ]);
            (StatusCode::OK, set_cookies, Json(body)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// POST /api/auth/logout: clear the slot and the browser cookies, tell the legacy server.
pub async fn logout_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let credentials = proxy::resolve_session(&headers, &state.config.legacy, &state.store).await;
    if let Err(e) = state.store.clear().await {
        return RelayError::from(e).into_response();
    }
    if let Some(c) = credentials {
        state
            .login
            .logout(&c.session_id, c.csrf_token.as_deref())
            .await;
    }
    let names = &state.config.legacy.cookies;
    let expire = AppendHeaders([
        (SET_COOKIE, cookies::expired_browser_cookie(&names.session)),
        (SET_COOKIE, cookies::expired_browser_cookie(&names.csrf)),
    ]);
    tracing::info!("logged out");
    (
        StatusCode::OK,
        expire,
        Json(LogoutResponse {
            success: true,
            message: "logged out".to_string(),
        }),
    )
        .into_response()
}

/// GET /api/auth/session: whether the slot holds a valid session.
pub async fn session_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = match state.store.get().await {
        Some(record) => SessionStatus {
            authenticated: record.is_valid(),
            username: record.username,
            login_time: record.login_time,
        },
        None => SessionStatus {
            authenticated: false,
            username: None,
            login_time: None,
        },
    };
    (StatusCode::OK, Json(status))
}

/// ANY /api/proxy?path=...: forward to the legacy server; remaining query params ride along.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    params: Result<Query<Vec<(String, String)>>, QueryRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Query(params) = match params {
        Ok(q) => q,
        Err(e) => return RelayError::InvalidRequest(e.body_text()).into_response(),
    };
    let mut path = None;
    let mut query = Vec::with_capacity(params.len());
    for (k, v) in params {
        if k == "path" && path.is_none() {
            path = Some(v);
        } else {
            query.push((k, v));
        }
    }
    let Some(path) = path.filter(|p| !p.trim().is_empty()) else {
        return RelayError::MissingPath.into_response();
    };
    let request = ProxyRequest {
        path,
        query,
        method,
        headers,
        body,
    };
    match state.proxy.forward(request).await {
        Ok(resp) => {
            let rotated: Vec<_> = resp
                .rotated_csrf
                .iter()
                .map(|token| {
                    (
                        SET_COOKIE,
                        cookies::browser_cookie(&state.config.legacy.cookies.csrf, token, false),
                    )
                })
                .collect();
            (resp.status, AppendHeaders(rotated), Json(resp.body)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )],
        metrics::encode(),
    )
}
