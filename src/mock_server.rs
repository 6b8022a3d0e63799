//! Mock legacy server for development and testing.
//!
//! Run with `session-relay mock-legacy --config mocks/legacy.yaml`. Requests are matched against
//! the YAML routes in order (method, path, query params, body substring); the first match wins
//! and its response (status, headers, Set-Cookie list, body from file or inline) is served.

use anyhow::Context;
use axum::body::{Body, Bytes};
use axum::http::header::{HeaderName, HeaderValue, SET_COOKIE};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Mock server config (YAML).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockConfig {
    /// Bind address:port (default "127.0.0.1:0" = pick port).
    #[serde(default)]
    pub bind: Option<String>,

    /// Routes in order; first match wins.
    pub routes: Vec<MockRoute>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockRoute {
    #[serde(rename = "match")]
    pub match_: MatchRule,

    pub response: ResponseSpec,
}

/// Request match. `method` absent = any; query value "*" = any value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchRule {
    #[serde(default)]
    pub method: Option<String>,

    pub path: String,

    #[serde(default)]
    pub query: HashMap<String, String>,

    /// Substring the raw request body must contain (e.g. "password=secret").
    #[serde(default)]
    pub body_contains: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseSpec {
    #[serde(default = "default_status")]
    pub status: u16,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// One `Set-Cookie` header per entry.
    #[serde(default)]
    pub set_cookies: Vec<String>,

    /// Path to file containing response body (relative to config file dir).
    #[serde(default)]
    pub body_file: Option<String>,

    /// Inline body (used if body_file is not set).
    #[serde(default)]
    pub body: Option<String>,
}

fn default_status() -> u16 {
    200
}

pub fn parse_mock_config(yaml: &str) -> anyhow::Result<MockConfig> {
    serde_yaml_ng::from_str(yaml).context("parse mock config YAML")
}

pub fn load_mock_config(path: &Path) -> anyhow::Result<MockConfig> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("read mock config {}", path.display()))?;
    parse_mock_config(&s)
}

/// Resolve body: load from file (relative to config_dir) or use inline.
fn resolve_body(spec: &ResponseSpec, config_dir: &Path) -> anyhow::Result<Bytes> {
    if let Some(ref path) = spec.body_file {
        let full = config_dir.join(path);
        let bytes =
            std::fs::read(&full).with_context(|| format!("read body_file {}", full.display()))?;
        return Ok(Bytes::from(bytes));
    }
    Ok(spec
        .body
        .as_ref()
        .map(|s| Bytes::from(s.clone()))
        .unwrap_or_default())
}

/// Parse query string into key-value map (no percent-decoding).
fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|p| {
            let mut it = p.splitn(2, '=');
            let k = it.next()?.trim();
            if k.is_empty() {
                return None;
            }
            let v = it.next().unwrap_or("").trim();
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

fn rule_matches(rule: &MatchRule, method: &Method, path: &str, query: &str, body: &str) -> bool {
    if rule
        .method
        .as_deref()
        .is_some_and(|m| !m.eq_ignore_ascii_case(method.as_str()))
    {
        return false;
    }
    if rule.path != path {
        return false;
    }
    if rule
        .body_contains
        .as_deref()
        .is_some_and(|needle| !body.contains(needle))
    {
        return false;
    }
    let params = parse_query(query);
    rule.query.iter().all(|(key, expected)| {
        params
            .get(key)
            .is_some_and(|actual| expected == "*" || expected == actual)
    })
}

/// A route with its body preloaded.
struct LoadedRoute {
    rule: MatchRule,
    spec: ResponseSpec,
    body: Bytes,
}

fn render(route: &LoadedRoute) -> Response {
    let status = StatusCode::from_u16(route.spec.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Body::from(route.body.clone()));
    *response.status_mut() = status;
    for (k, v) in &route.spec.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(k.as_str()),
            HeaderValue::try_from(v.as_str()),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    for cookie in &route.spec.set_cookies {
        if let Ok(value) = HeaderValue::try_from(cookie.as_str()) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    response
}

/// Build the mock app from a config; body files resolve against `config_dir`.
pub fn build_mock_app(config: &MockConfig, config_dir: &Path) -> anyhow::Result<axum::Router> {
    let routes = config
        .routes
        .iter()
        .map(|r| {
            let body = resolve_body(&r.response, config_dir).context("resolve response body")?;
            Ok(LoadedRoute {
                rule: r.match_.clone(),
                spec: r.response.clone(),
                body,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let routes = Arc::new(routes);

    let handler = move |method: Method, uri: axum::http::Uri, body: Bytes| {
        let routes = routes.clone();
        async move {
            let path = uri.path();
            let query = uri.query().unwrap_or("");
            let body = String::from_utf8_lossy(&body);
            match routes
                .iter()
                .find(|r| rule_matches(&r.rule, &method, path, query, &body))
            {
                Some(route) => render(route),
                None => (
                    StatusCode::NOT_FOUND,
                    format!("no mock route matched {} {}", method, path),
                )
                    .into_response(),
            }
        }
    };
    Ok(axum::Router::new().fallback(handler))
}

/// Run the mock server: load config, bind, serve requests until shutdown.
pub async fn run_mock_server(config_path: &Path) -> anyhow::Result<()> {
    let config = load_mock_config(config_path)?;
    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let app = build_mock_app(&config, config_dir)?;
    let bind = config.bind.as_deref().unwrap_or("127.0.0.1:0");

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context("bind mock server")?;
    let addr = listener.local_addr().context("mock server local_addr")?;
    info!(%addr, routes = config.routes.len(), "mock legacy server listening (Ctrl+C to stop)");
    eprintln!("mock legacy server at http://{}", addr);

    axum::serve(listener, app).await.context("serve mock server")?;
    Ok(())
}
