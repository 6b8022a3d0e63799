//! Health endpoints: /healthz (liveness plus detail) and /readyz.
//!
//! **Readyz semantics:** ready when the session storage answers a read. The legacy server is
//! not probed: it is reported in the body but its availability does not gate readiness.

use crate::api::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub version: String,
    pub uptime_secs: f64,
    pub session_backend: String,
    pub legacy_base_url: String,
}

#[derive(Debug, Serialize)]
pub struct ReadyBody {
    pub version: String,
    pub uptime_secs: f64,
    pub ready: bool,
    pub session_store_connected: bool,
    pub session_backend: String,
}

fn version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

pub fn build_health_body(state: &AppState) -> HealthBody {
    HealthBody {
        version: version(),
        uptime_secs: state.started_at.elapsed().as_secs_f64(),
        session_backend: state.store.backend().to_string(),
        legacy_base_url: state.config.legacy.resolved_base_url(),
    }
}

pub async fn build_ready_body(state: &AppState) -> ReadyBody {
    let session_store_connected = state.store.is_reachable().await;
    ReadyBody {
        version: version(),
        uptime_secs: state.started_at.elapsed().as_secs_f64(),
        ready: session_store_connected,
        session_store_connected,
        session_backend: state.store.backend().to_string(),
    }
}

/// Handler for GET /healthz: 200 + detailed JSON.
pub async fn healthz_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, axum::Json(build_health_body(state.as_ref())))
}

/// Handler for GET /readyz: 200 if ready, 503 if not; detailed JSON either way.
pub async fn readyz_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = build_ready_body(state.as_ref()).await;
    let status = if body.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, axum::Json(body))
}
