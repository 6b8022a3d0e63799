//! Login relay: exchange username/password for a legacy server session.
//!
//! The legacy server has no API contract for login: it serves an HTML page carrying an
//! anti-CSRF token, accepts a form POST, and answers with either a redirect, a rendered page or
//! the login page again. The exchange is:
//!
//! 1. GET the login page, capture its cookies and scrape the CSRF token;
//! 2. POST the credentials form with those cookies, redirects not followed;
//! 3. classify the answer with [`classify_login_response`] (ordered, first match wins).
//!
//! The CSRF fetch always completes before the credential POST. Nothing is retried.

use crate::config::LegacyConfig;
use crate::cookies;
use crate::error::RelayError;
use crate::metrics;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use reqwest::header::{COOKIE, LOCATION};
use std::time::Instant;

/// Body text meaning "you are logged in". Checked before the login-page markers.
pub const SUCCESS_MARKERS: &[&str] = &["logout", "로그아웃", "main", "dashboard"];

/// Body text meaning "this is the login page again".
pub const LOGIN_PAGE_MARKERS: &[&str] = &["login.jsp", "로그인"];

pub const GENERIC_LOGIN_FAILURE: &str = "invalid username or password";

static ERROR_CONTAINER_RE: Lazy<Regex> = Lazy::new(|| {
    // Opening tags nested inside the container are skipped; an empty container never matches.
    Regex::new(r#"(?is)<[a-z][a-z0-9]*\b[^>]*\bclass\s*=\s*["'][^"']*error[^"']*["'][^>]*>(?:\s*<[a-z][^>]*>)*\s*([^<\s][^<]*?)\s*<"#)
        .expect("error container pattern")
});

static ALERT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"alert\(\s*["']([^"']+)["']\s*\)"#).expect("alert pattern")
});

/// How confident the relay is that the login really succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    /// Redirect or success marker.
    Confirmed,
    /// Only evidence is a freshly issued session id.
    Ambiguous,
}

/// Classification of the credential POST response, in precedence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// 3xx: the legacy server redirects after a successful form login.
    Redirected {
        session_id: Option<String>,
        location: Option<String>,
    },
    /// Body contains a success marker.
    SuccessMarker { session_id: Option<String> },
    /// Body is the login page again; `message` is scraped or generic.
    LoginPageEcho { message: String },
    /// No marker matched but a different session id was issued. Low-confidence success:
    /// nothing proves authentication happened, kept for compatibility.
    NewSessionIssued { session_id: String },
    /// Nothing matched and the session did not change.
    Rejected,
}

impl LoginOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Redirected { .. } => "redirect",
            Self::SuccessMarker { .. } => "success_marker",
            Self::LoginPageEcho { .. } | Self::Rejected => "rejected",
            Self::NewSessionIssued { .. } => "ambiguous",
        }
    }
}

/// What the POST response looked like, reduced to the fields classification needs.
#[derive(Debug, Clone, Default)]
pub struct LoginResponseView<'a> {
    pub status: u16,
    pub location: Option<&'a str>,
    pub set_cookies: &'a [String],
    pub body: &'a str,
}

/// Ordered decision procedure: redirect, success marker, login-page echo, session change.
pub fn classify_login_response(
    response: &LoginResponseView<'_>,
    session_cookie: &str,
    previous_session_id: Option<&str>,
) -> LoginOutcome {
    let issued = cookies::find_set_cookie_value(response.set_cookies, session_cookie);
    if (300..400).contains(&response.status) {
        return LoginOutcome::Redirected {
            session_id: issued,
            location: response.location.map(str::to_string),
        };
    }
    if SUCCESS_MARKERS.iter().any(|m| response.body.contains(m)) {
        return LoginOutcome::SuccessMarker { session_id: issued };
    }
    if LOGIN_PAGE_MARKERS.iter().any(|m| response.body.contains(m)) {
        let message = scrape_error_message(response.body)
            .unwrap_or_else(|| GENERIC_LOGIN_FAILURE.to_string());
        return LoginOutcome::LoginPageEcho { message };
    }
    match issued {
        Some(id) if Some(id.as_str()) != previous_session_id => {
            LoginOutcome::NewSessionIssued { session_id: id }
        }
        _ => LoginOutcome::Rejected,
    }
}

/// Best-effort human-readable error from a login page: an element whose class contains
/// "error", else a JS `alert("...")` argument.
pub fn scrape_error_message(body: &str) -> Option<String> {
    ERROR_CONTAINER_RE
        .captures(body)
        .or_else(|| ALERT_RE.captures(body))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSuccess {
    pub session_id: String,
    pub csrf_token: String,
    pub redirect_url: Option<String>,
    pub confidence: Confidence,
}

/// Performs the two-step exchange against the legacy server.
#[derive(Clone)]
pub struct LoginRelay {
    client: Client,
    legacy: LegacyConfig,
    csrf_patterns: Vec<Regex>,
}

impl LoginRelay {
    pub fn new(client: Client, legacy: LegacyConfig) -> anyhow::Result<Self> {
        let csrf_patterns = csrf_token_patterns(&legacy.fields.csrf)?;
        Ok(Self {
            client,
            legacy,
            csrf_patterns,
        })
    }

    /// Token from the login page HTML, if the marker attribute is present with a non-empty value.
    pub fn extract_csrf_token(&self, html: &str) -> Option<String> {
        self.csrf_patterns
            .iter()
            .find_map(|re| re.captures(html))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .filter(|s| !s.is_empty())
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginSuccess, RelayError> {
        let result = self.exchange(username, password).await;
        // Classified responses are counted in `exchange`.
        match &result {
            Err(RelayError::CsrfTokenMissing) => metrics::record_login("csrf_missing"),
            Err(RelayError::Upstream { .. }) => metrics::record_login("error"),
            _ => {}
        }
        result
    }

    async fn exchange(&self, username: &str, password: &str) -> Result<LoginSuccess, RelayError> {
        let login_page_url = self.legacy.url_for(&self.legacy.login_page_path);
        let started = Instant::now();
        let page = self
            .client
            .get(&login_page_url)
            .send()
            .await
            .map_err(|e| RelayError::upstream("fetch login page", e))?;
        let page_cookies = cookies::extract_set_cookies(page.headers());
        let html = page
            .text()
            .await
            .map_err(|e| RelayError::upstream("read login page", e))?;
        metrics::record_upstream_duration("login_page", started.elapsed().as_secs_f64());

        let csrf_token = self
            .extract_csrf_token(&html)
            .ok_or(RelayError::CsrfTokenMissing)?;
        let previous_session_id =
            cookies::find_set_cookie_value(&page_cookies, &self.legacy.cookies.session);
        tracing::debug!(
            cookies = page_cookies.len(),
            "login page fetched, csrf token found"
        );

        let fields = &self.legacy.fields;
        let form = [
            (fields.remember_me.as_str(), "true"),
            (fields.csrf.as_str(), csrf_token.as_str()),
            (fields.username.as_str(), username),
            (fields.password.as_str(), password),
        ];
        let mut request = self
            .client
            .post(self.legacy.url_for(&self.legacy.auth_path))
            .form(&form);
        if let Some(cookie) = cookies::cookie_header_from_set_cookies(&page_cookies) {
            request = request.header(COOKIE, cookie);
        }
        let started = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| RelayError::upstream("submit credentials", e))?;
        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let set_cookies = cookies::extract_set_cookies(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| RelayError::upstream("read login response", e))?;
        metrics::record_upstream_duration("login_submit", started.elapsed().as_secs_f64());

        let view = LoginResponseView {
            status,
            location: location.as_deref(),
            set_cookies: &set_cookies,
            body: &body,
        };
        let outcome = classify_login_response(
            &view,
            &self.legacy.cookies.session,
            previous_session_id.as_deref(),
        );
        tracing::debug!(status, outcome = outcome.label(), "login response classified");
        metrics::record_login(outcome.label());

        // A rotated CSRF cookie on the login response supersedes the page token.
        let csrf_token = cookies::find_set_cookie_value(&set_cookies, &self.legacy.cookies.csrf)
            .unwrap_or(csrf_token);

        let (session_id, redirect_url, confidence) = match outcome {
            LoginOutcome::Redirected {
                session_id,
                location,
            } => (session_id, location, Confidence::Confirmed),
            LoginOutcome::SuccessMarker { session_id } => (session_id, None, Confidence::Confirmed),
            LoginOutcome::NewSessionIssued { session_id } => {
                tracing::warn!(
                    status,
                    "login accepted only because a new session id was issued"
                );
                (Some(session_id), None, Confidence::Ambiguous)
            }
            LoginOutcome::LoginPageEcho { message } => {
                return Err(RelayError::AuthenticationFailed(message));
            }
            LoginOutcome::Rejected => {
                return Err(RelayError::AuthenticationFailed(
                    GENERIC_LOGIN_FAILURE.to_string(),
                ));
            }
        };

        // Servers that keep the pre-login session id do not re-issue the cookie.
        let session_id = session_id.or(previous_session_id).ok_or_else(|| {
            RelayError::AuthenticationFailed("legacy server issued no session".to_string())
        })?;

        Ok(LoginSuccess {
            session_id,
            csrf_token,
            redirect_url,
            confidence,
        })
    }

    /// Best-effort legacy logout. Errors are logged only.
    pub async fn logout(&self, session_id: &str, csrf_token: Option<&str>) {
        let Some(path) = self.legacy.logout_path.as_deref() else {
            return;
        };
        let headers = match crate::client::session_headers(&self.legacy, session_id, csrf_token) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "legacy logout skipped");
                return;
            }
        };
        match self
            .client
            .post(self.legacy.url_for(path))
            .headers(headers)
            .send()
            .await
        {
            Ok(r) => tracing::debug!(status = r.status().as_u16(), "legacy logout sent"),
            Err(e) => tracing::warn!(error = %e, "legacy logout failed"),
        }
    }
}

/// `<input name="_csrf" value="...">` (either attribute order) and `<meta name="_csrf" content="...">`.
fn csrf_token_patterns(field: &str) -> anyhow::Result<Vec<Regex>> {
    let name = regex::escape(field);
    let named = format!(r#"(?:name|id)\s*=\s*["']{}["']"#, name);
    let value = r#"(?:value|content)\s*=\s*["']([^"']*)["']"#;
    Ok(vec![
        Regex::new(&format!(r#"(?is)<[^>]*{}[^>]*?{}"#, named, value))?,
        Regex::new(&format!(r#"(?is)<[^>]*{}[^>]*?{}"#, value, named))?,
        Regex::new(&format!(r#"{}\s*=\s*["']([^"']*)["']"#, name))?,
    ])
}
