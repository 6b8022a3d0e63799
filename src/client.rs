//! HTTP client for the legacy server: timeouts from config, redirects never followed
//! (a login redirect is itself the success signal, and proxied redirects are relayed as-is).

use crate::config::LegacyConfig;
use anyhow::Context;
use reqwest::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;

/// Marks a request as programmatic so the legacy server answers with data, not an HTML redirect.
pub const AJAX_HEADER: &str = "X-Requested-With";
pub const AJAX_HEADER_VALUE: &str = "XMLHttpRequest";
pub const AJAX_ACCEPT: &str = "application/json, text/plain, */*";

/// Build a reqwest client for the legacy server.
pub fn build_client(legacy: &LegacyConfig) -> anyhow::Result<Client> {
    let timeout_secs = legacy.timeout_secs.max(1);
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(std::cmp::min(10, timeout_secs)))
        .timeout(Duration::from_secs(timeout_secs))
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(concat!("session-relay/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("build reqwest client")?;
    Ok(client)
}

/// Headers attached to every proxied call: cookie pair(s), duplicated CSRF header, AJAX markers.
pub fn session_headers(
    legacy: &LegacyConfig,
    session_id: &str,
    csrf_token: Option<&str>,
) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let mut cookie = format!("{}={}", legacy.cookies.session, session_id);
    if let Some(token) = csrf_token.filter(|t| !t.is_empty()) {
        cookie.push_str(&format!("; {}={}", legacy.cookies.csrf, token));
        let name = HeaderName::try_from(legacy.csrf_header.as_str())
            .with_context(|| format!("invalid csrf header name: {:?}", legacy.csrf_header))?;
        let value = HeaderValue::try_from(token).context("invalid csrf token value")?;
        headers.insert(name, value);
    }
    headers.insert(
        reqwest::header::COOKIE,
        HeaderValue::try_from(cookie).context("invalid session cookie value")?,
    );
    headers.insert(AJAX_HEADER, HeaderValue::from_static(AJAX_HEADER_VALUE));
    headers.insert(ACCEPT, HeaderValue::from_static(AJAX_ACCEPT));
    Ok(headers)
}
