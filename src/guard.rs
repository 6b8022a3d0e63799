//! Auth guard for the static front-end: protected views redirect to the login view unless the
//! session store holds a valid session.

use crate::config::ServerConfig;
use crate::session::SessionStore;
use axum::Router;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Redirect, Response};
use std::path::Path;
use std::sync::Arc;
use tower_http::services::ServeDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Render,
    RedirectToLogin,
}

#[derive(Clone)]
pub struct GuardState {
    pub server: Arc<ServerConfig>,
    pub store: SessionStore,
}

/// Login view, or a configured public path. Entries ending in `/` match as prefixes.
pub fn is_public_path(path: &str, server: &ServerConfig) -> bool {
    if path == server.login_view {
        return true;
    }
    server.public_paths.iter().any(|p| {
        if p.ends_with('/') {
            path.starts_with(p.as_str())
        } else {
            path == p
        }
    })
}

pub fn decide(path: &str, server: &ServerConfig, session_valid: bool) -> GuardDecision {
    if session_valid || is_public_path(path, server) {
        GuardDecision::Render
    } else {
        GuardDecision::RedirectToLogin
    }
}

pub async fn require_session(
    State(guard): State<GuardState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    // Public paths never touch the store.
    let session_valid = !is_public_path(&path, &guard.server) && guard.store.is_valid().await;
    match decide(&path, &guard.server, session_valid) {
        GuardDecision::Render => next.run(request).await,
        GuardDecision::RedirectToLogin => {
            tracing::debug!(%path, "no valid session, redirecting to login view");
            Redirect::to(&guard.server.login_view).into_response()
        }
    }
}

/// Static files under `dir`, every request passing through [`require_session`].
pub fn static_router(dir: &Path, guard: GuardState) -> Router {
    Router::new()
        .fallback_service(ServeDir::new(dir))
        .layer(middleware::from_fn_with_state(guard, require_session))
}
