//! Generic request proxy: forward an application-data call to the legacy server with the
//! session attached, and relay the answer as JSON.
//!
//! Session resolution order: explicit `X-Session-Id` / `X-CSRF-Token` request headers (a
//! browser juggling several identities), then the browser's `Cookie` header, then the session
//! store. With no session id the call fails before the backend is contacted.

use crate::client;
use crate::config::LegacyConfig;
use crate::cookies;
use crate::error::RelayError;
use crate::metrics;
use crate::session::SessionStore;
use axum::body::Bytes;
use reqwest::header::{ACCEPT_LANGUAGE, CONTENT_TYPE, COOKIE, HeaderMap};
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::Value;
use std::time::Instant;

pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const CSRF_TOKEN_HEADER: &str = "x-csrf-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Headers,
    Cookies,
    Store,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub session_id: String,
    pub csrf_token: Option<String>,
    pub source: CredentialSource,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Resolve the credentials for one proxied call.
pub async fn resolve_session(
    headers: &HeaderMap,
    legacy: &LegacyConfig,
    store: &SessionStore,
) -> Option<SessionCredentials> {
    let browser_cookies = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(cookies::parse_cookie_header)
        .fold(std::collections::HashMap::new(), |mut acc, m| {
            acc.extend(m);
            acc
        });
    let cookie_csrf = browser_cookies
        .get(&legacy.cookies.csrf)
        .filter(|v| !v.is_empty())
        .cloned();

    if let Some(session_id) = header_str(headers, SESSION_ID_HEADER) {
        let csrf_token = header_str(headers, CSRF_TOKEN_HEADER)
            .map(str::to_string)
            .or(cookie_csrf);
        return Some(SessionCredentials {
            session_id: session_id.to_string(),
            csrf_token,
            source: CredentialSource::Headers,
        });
    }
    if let Some(session_id) = browser_cookies
        .get(&legacy.cookies.session)
        .filter(|v| !v.is_empty())
    {
        return Some(SessionCredentials {
            session_id: session_id.clone(),
            csrf_token: cookie_csrf,
            source: CredentialSource::Cookies,
        });
    }
    store
        .get()
        .await
        .filter(|r| !r.session_id.is_empty())
        .map(|r| SessionCredentials {
            session_id: r.session_id,
            csrf_token: Some(r.csrf_token).filter(|t| !t.is_empty()),
            source: CredentialSource::Store,
        })
}

/// One inbound call to relay.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// Backend path (may carry its own query string).
    pub path: String,
    /// Extra query parameters appended to the backend URL.
    pub query: Vec<(String, String)>,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    /// Backend status, relayed verbatim.
    pub status: StatusCode,
    /// Backend JSON, or `{"data": "<text>"}` when the body was not JSON.
    pub body: Value,
    /// CSRF token adopted from the backend's Set-Cookie.
    pub rotated_csrf: Option<String>,
}

/// Body parsed as JSON, else the raw text wrapped as `{"data": ...}`.
pub fn structured_body(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| serde_json::json!({ "data": text }))
}

fn carries_body(method: &Method) -> bool {
    *method != Method::GET && *method != Method::HEAD
}

#[derive(Clone)]
pub struct ProxyRelay {
    client: Client,
    legacy: LegacyConfig,
    store: SessionStore,
}

impl ProxyRelay {
    pub fn new(client: Client, legacy: LegacyConfig, store: SessionStore) -> Self {
        Self {
            client,
            legacy,
            store,
        }
    }

    fn backend_url(&self, request: &ProxyRequest) -> Result<Url, RelayError> {
        let mut url = Url::parse(&self.legacy.url_for(&request.path))
            .map_err(|e| RelayError::InvalidRequest(format!("invalid backend path: {}", e)))?;
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &request.query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    pub async fn forward(&self, request: ProxyRequest) -> Result<ProxyResponse, RelayError> {
        if request.path.trim().is_empty() {
            return Err(RelayError::MissingPath);
        }
        let credentials = resolve_session(&request.headers, &self.legacy, &self.store)
            .await
            .ok_or(RelayError::Unauthenticated)?;
        let url = self.backend_url(&request)?;
        let session_headers = client::session_headers(
            &self.legacy,
            &credentials.session_id,
            credentials.csrf_token.as_deref(),
        )
        .map_err(|e| RelayError::InvalidRequest(format!("{:#}", e)))?;

        tracing::debug!(
            method = %request.method,
            path = %url.path(),
            credentials = ?credentials.source,
            "forwarding to legacy server"
        );

        let mut outbound = self
            .client
            .request(request.method.clone(), url)
            .headers(session_headers);
        if let Some(lang) = request.headers.get(ACCEPT_LANGUAGE) {
            outbound = outbound.header(ACCEPT_LANGUAGE, lang.clone());
        }
        if carries_body(&request.method) && !request.body.is_empty() {
            outbound = match serde_json::from_slice::<Value>(&request.body) {
                Ok(json) => outbound.json(&json),
                Err(_) => {
                    let content_type = request
                        .headers
                        .get(CONTENT_TYPE)
                        .cloned()
                        .unwrap_or_else(|| {
                            reqwest::header::HeaderValue::from_static("text/plain; charset=utf-8")
                        });
                    outbound
                        .header(CONTENT_TYPE, content_type)
                        .body(request.body.clone())
                }
            };
        }

        let method_label = request.method.as_str().to_string();
        let started = Instant::now();
        let response = match outbound.send().await {
            Ok(r) => r,
            Err(e) => {
                metrics::record_proxy_request(&method_label, "error");
                return Err(RelayError::upstream("forward request", e));
            }
        };
        let status = response.status();
        let set_cookies = cookies::extract_set_cookies(response.headers());
        let text = response
            .text()
            .await
            .map_err(|e| RelayError::upstream("read backend response", e))?;
        metrics::record_upstream_duration("proxy", started.elapsed().as_secs_f64());
        metrics::record_proxy_request(&method_label, metrics::status_class(status.as_u16()));

        let rotated_csrf = self.adopt_rotated_csrf(&credentials, &set_cookies).await;
        Ok(ProxyResponse {
            status,
            body: structured_body(&text),
            rotated_csrf,
        })
    }

    /// A backend Set-Cookie carrying the CSRF cookie rotates the token. The stored record is
    /// only updated when the call ran under the stored session; the token is returned for the
    /// browser either way. Store failures are logged; the proxied response is unaffected.
    async fn adopt_rotated_csrf(
        &self,
        credentials: &SessionCredentials,
        set_cookies: &[String],
    ) -> Option<String> {
        let csrf_name = self.legacy.cookies.csrf.as_str();
        let rotated = set_cookies.iter().rev().find(|c| {
            cookies::cookie_pair(c).is_some_and(|(n, v)| n == csrf_name && !v.is_empty())
        })?;
        if self.runs_as_stored_session(credentials).await {
            if let Err(e) = self.store.update_csrf_token(rotated).await {
                tracing::warn!(error = %e, "failed to store rotated csrf token");
            }
        } else {
            tracing::debug!(
                credentials = ?credentials.source,
                "csrf rotation for another session, store left unchanged"
            );
        }
        cookies::cookie_pair(rotated).map(|(_, v)| v.to_string())
    }

    async fn runs_as_stored_session(&self, credentials: &SessionCredentials) -> bool {
        if credentials.source == CredentialSource::Store {
            return true;
        }
        self.store
            .get()
            .await
            .is_some_and(|r| r.session_id == credentials.session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::build_client;
    use crate::session::{MemoryStorage, SessionRecord, SessionStorage};
    use async_trait::async_trait;
    use reqwest::header::HeaderValue;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_json, body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Memory storage that counts writes.
    #[derive(Default)]
    struct CountingStorage {
        inner: MemoryStorage,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl SessionStorage for CountingStorage {
        fn backend(&self) -> &'static str {
            "counting"
        }
        async fn read(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.read(key).await
        }
        async fn write(&self, key: &str, value: &str) -> anyhow::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.write(key, value).await
        }
        async fn remove(&self, key: &str) -> anyhow::Result<()> {
            self.inner.remove(key).await
        }
    }

    fn legacy_for(server: &MockServer) -> LegacyConfig {
        LegacyConfig {
            base_url: Some(server.uri()),
            ..LegacyConfig::default()
        }
    }

    fn relay_with_store(server: &MockServer, store: SessionStore) -> ProxyRelay {
        let legacy = legacy_for(server);
        ProxyRelay::new(build_client(&legacy).unwrap(), legacy, store)
    }

    fn request(method: Method, path: &str, headers: HeaderMap, body: &str) -> ProxyRequest {
        ProxyRequest {
            path: path.to_string(),
            query: Vec::new(),
            method,
            headers,
            body: Bytes::from(body.to_string()),
        }
    }

    fn cookie_headers(cookie: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(COOKIE, HeaderValue::try_from(cookie).unwrap());
        h
    }

    #[tokio::test]
    async fn no_session_is_401_without_backend_call() {
        let server = MockServer::start().await;
        Mock::given(wiremock::matchers::any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let store = SessionStore::new(Arc::new(MemoryStorage::new()), "mis_session", "CSRF-TOKEN");
        let relay = relay_with_store(&server, store);

        let err = relay
            .forward(request(Method::GET, "/api/hr/employees", HeaderMap::new(), ""))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Unauthenticated));
        assert_eq!(err.status().as_u16(), 401);
        assert_eq!(server.received_requests().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn empty_path_is_400() {
        let server = MockServer::start().await;
        let relay = relay_with_store(&server, SessionStore::detached());
        let err = relay
            .forward(request(Method::GET, " ", cookie_headers("JSESSIONID=a"), ""))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::MissingPath));
    }

    #[tokio::test]
    async fn cookie_session_attaches_headers_and_relays_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/hr/employees"))
            .and(query_param("dept", "finance"))
            .and(header("cookie", "JSESSIONID=abcd; CSRF-TOKEN=tok1"))
            .and(header("x-csrf-token", "tok1"))
            .and(header("x-requested-with", "XMLHttpRequest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"id": 1}])))
            .expect(1)
            .mount(&server)
            .await;
        let relay = relay_with_store(&server, SessionStore::detached());
        let mut req = request(
            Method::GET,
            "/api/hr/employees",
            cookie_headers("JSESSIONID=abcd; CSRF-TOKEN=tok1"),
            "",
        );
        req.query.push(("dept".to_string(), "finance".to_string()));

        let resp = relay.forward(req).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, serde_json::json!([{"id": 1}]));
        assert_eq!(resp.rotated_csrf, None);
    }

    #[tokio::test]
    async fn explicit_headers_win_over_cookies_and_store() {
        let storage = Arc::new(MemoryStorage::new());
        let store = SessionStore::new(storage, "mis_session", "CSRF-TOKEN");
        store
            .set(&SessionRecord {
                session_id: "stored".to_string(),
                csrf_token: "stored-tok".to_string(),
                username: None,
                login_time: None,
            })
            .await
            .unwrap();
        let legacy = LegacyConfig::default();

        let mut headers = cookie_headers("JSESSIONID=cookie; CSRF-TOKEN=cookie-tok");
        headers.insert(SESSION_ID_HEADER, HeaderValue::from_static("explicit"));
        headers.insert(CSRF_TOKEN_HEADER, HeaderValue::from_static("explicit-tok"));
        let creds = resolve_session(&headers, &legacy, &store).await.unwrap();
        assert_eq!(creds.session_id, "explicit");
        assert_eq!(creds.csrf_token.as_deref(), Some("explicit-tok"));
        assert_eq!(creds.source, CredentialSource::Headers);

        let creds = resolve_session(&cookie_headers("JSESSIONID=cookie"), &legacy, &store)
            .await
            .unwrap();
        assert_eq!(creds.session_id, "cookie");
        assert_eq!(creds.csrf_token, None);
        assert_eq!(creds.source, CredentialSource::Cookies);

        let creds = resolve_session(&HeaderMap::new(), &legacy, &store).await.unwrap();
        assert_eq!(creds.session_id, "stored");
        assert_eq!(creds.csrf_token.as_deref(), Some("stored-tok"));
        assert_eq!(creds.source, CredentialSource::Store);
    }

    #[tokio::test]
    async fn json_body_is_reserialized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/finance/report"))
            .and(header("content-type", "application/json"))
            .and(body_json(serde_json::json!({"year": 2024, "q": [1, 2]})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;
        let relay = relay_with_store(&server, SessionStore::detached());
        let resp = relay
            .forward(request(
                Method::POST,
                "/api/finance/report",
                cookie_headers("JSESSIONID=abcd"),
                r#"{ "year": 2024,   "q": [1,2] }"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::CREATED);
        assert_eq!(resp.body["ok"], true);
    }

    #[tokio::test]
    async fn non_json_body_forwarded_raw_and_text_response_wrapped() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/legacy/save.do"))
            .and(body_string("a=1&b=2"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .respond_with(ResponseTemplate::new(200).set_body_string("SAVED"))
            .expect(1)
            .mount(&server)
            .await;
        let relay = relay_with_store(&server, SessionStore::detached());
        let mut headers = cookie_headers("JSESSIONID=abcd");
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        let resp = relay
            .forward(request(Method::PUT, "legacy/save.do", headers, "a=1&b=2"))
            .await
            .unwrap();
        assert_eq!(resp.body, serde_json::json!({"data": "SAVED"}));
    }

    #[tokio::test]
    async fn backend_status_relayed_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404).set_body_string("<html>not found</html>"))
            .mount(&server)
            .await;
        let relay = relay_with_store(&server, SessionStore::detached());
        let resp = relay
            .forward(request(Method::DELETE, "/api/x/1", cookie_headers("JSESSIONID=abcd"), ""))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        assert_eq!(resp.body["data"], "<html>not found</html>");
    }

    #[tokio::test]
    async fn set_cookie_rotation_updates_store_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"rows": []}))
                    .insert_header("Set-Cookie", "CSRF-TOKEN=rotated9; Path=/"),
            )
            .mount(&server)
            .await;
        let storage = Arc::new(CountingStorage::default());
        let store = SessionStore::new(storage.clone(), "mis_session", "CSRF-TOKEN");
        store
            .set(&SessionRecord {
                session_id: "abcd".to_string(),
                csrf_token: "tok1".to_string(),
                username: Some("kim".to_string()),
                login_time: None,
            })
            .await
            .unwrap();
        assert_eq!(storage.writes.load(Ordering::SeqCst), 1);

        let relay = relay_with_store(&server, store.clone());
        let resp = relay
            .forward(request(Method::GET, "/api/perf", HeaderMap::new(), ""))
            .await
            .unwrap();

        assert_eq!(resp.rotated_csrf.as_deref(), Some("rotated9"));
        assert_eq!(storage.writes.load(Ordering::SeqCst), 2);
        let record = store.get().await.unwrap();
        assert_eq!(record.csrf_token, "rotated9");
        assert_eq!(record.session_id, "abcd");
    }

    #[tokio::test]
    async fn rotation_under_another_identity_leaves_store_alone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"rows": []}))
                    .insert_header("Set-Cookie", "CSRF-TOKEN=tokB2; Path=/"),
            )
            .mount(&server)
            .await;
        let storage = Arc::new(CountingStorage::default());
        let store = SessionStore::new(storage.clone(), "mis_session", "CSRF-TOKEN");
        store
            .set(&SessionRecord {
                session_id: "A".to_string(),
                csrf_token: "tokA".to_string(),
                username: Some("kim".to_string()),
                login_time: None,
            })
            .await
            .unwrap();
        let relay = relay_with_store(&server, store.clone());

        let mut headers = HeaderMap::new();
        headers.insert(SESSION_ID_HEADER, HeaderValue::from_static("B"));
        headers.insert(CSRF_TOKEN_HEADER, HeaderValue::from_static("tokB"));
        let resp = relay
            .forward(request(Method::GET, "/api/perf", headers, ""))
            .await
            .unwrap();
        assert_eq!(resp.rotated_csrf.as_deref(), Some("tokB2"));

        let resp = relay
            .forward(request(
                Method::GET,
                "/api/perf",
                cookie_headers("JSESSIONID=B; CSRF-TOKEN=tokB"),
                "",
            ))
            .await
            .unwrap();
        assert_eq!(resp.rotated_csrf.as_deref(), Some("tokB2"));

        let record = store.get().await.unwrap();
        assert_eq!(record.session_id, "A");
        assert_eq!(record.csrf_token, "tokA");
        assert_eq!(storage.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rotation_via_cookie_of_stored_session_updates_store() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({}))
                    .insert_header("Set-Cookie", "CSRF-TOKEN=tokA2; Path=/"),
            )
            .mount(&server)
            .await;
        let store = SessionStore::new(Arc::new(MemoryStorage::new()), "mis_session", "CSRF-TOKEN");
        store
            .set(&SessionRecord {
                session_id: "A".to_string(),
                csrf_token: "tokA".to_string(),
                username: None,
                login_time: None,
            })
            .await
            .unwrap();
        let relay = relay_with_store(&server, store.clone());
        relay
            .forward(request(
                Method::GET,
                "/api/perf",
                cookie_headers("JSESSIONID=A; CSRF-TOKEN=tokA"),
                "",
            ))
            .await
            .unwrap();
        assert_eq!(store.get().await.unwrap().csrf_token, "tokA2");
    }

    #[tokio::test]
    async fn unreachable_backend_is_500_with_detail() {
        let legacy = LegacyConfig {
            base_url: Some("http://127.0.0.1:1".to_string()),
            timeout_secs: 2,
            ..LegacyConfig::default()
        };
        let relay = ProxyRelay::new(build_client(&legacy).unwrap(), legacy, SessionStore::detached());
        let err = relay
            .forward(request(Method::GET, "/api", cookie_headers("JSESSIONID=abcd"), ""))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Upstream { .. }));
        assert_eq!(err.status().as_u16(), 500);
    }

    #[test]
    fn structured_body_wraps_text() {
        assert_eq!(structured_body("{\"a\":1}"), serde_json::json!({"a": 1}));
        assert_eq!(structured_body("plain"), serde_json::json!({"data": "plain"}));
        assert_eq!(structured_body(""), serde_json::json!({"data": ""}));
    }
}
