//! Relay error taxonomy. Every variant maps to an HTTP status and is rendered at the
//! boundary as `{ "success": false, "message": ..., "error"?: ... }`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

pub const CSRF_TOKEN_MISSING_MESSAGE: &str = "could not obtain a CSRF token from the login page";
pub const UNAUTHENTICATED_MESSAGE: &str = "no session; login required";
pub const UPSTREAM_MESSAGE: &str = "legacy server request failed";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Login page did not carry the CSRF marker.
    #[error("{}", CSRF_TOKEN_MISSING_MESSAGE)]
    CsrfTokenMissing,

    /// Legacy server rejected the credentials (scraped or generic message).
    #[error("{0}")]
    AuthenticationFailed(String),

    /// Proxy call without a resolvable session id. Raised before any backend call.
    #[error("{}", UNAUTHENTICATED_MESSAGE)]
    Unauthenticated,

    /// Proxy call without the `path` query parameter.
    #[error("path query parameter is required")]
    MissingPath,

    #[error("{0}")]
    InvalidRequest(String),

    /// Network-level failure talking to the legacy server.
    #[error("{}: {context}", UPSTREAM_MESSAGE)]
    Upstream {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("session storage: {0:#}")]
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for RelayError {
    fn from(e: anyhow::Error) -> Self {
        Self::Storage(e)
    }
}

impl RelayError {
    pub fn upstream(context: &'static str, source: reqwest::Error) -> Self {
        Self::Upstream { context, source }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::CsrfTokenMissing | Self::MissingPath | Self::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::AuthenticationFailed(_) | Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Upstream { .. } | Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Diagnostic detail for 500-class errors (underlying error text).
    fn detail(&self) -> Option<String> {
        match self {
            Self::Upstream { source, .. } => Some(source.to_string()),
            Self::Storage(e) => Some(format!("{:#}", e)),
            _ => None,
        }
    }

    /// Message shown to the user.
    fn public_message(&self) -> String {
        match self {
            Self::Upstream { .. } => UPSTREAM_MESSAGE.to_string(),
            Self::Storage(_) => "session storage unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "relay request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "relay request rejected");
        }
        let body = ErrorBody {
            success: false,
            message: self.public_message(),
            error: self.detail(),
        };
        (status, Json(body)).into_response()
    }
}
