//! Configuration schema for the relay.
//!
//! YAML config: global (logging, metrics, audit), server, legacy, session.
//! Every section has defaults, so running without a config file is valid.
//! Env overrides: RELAY_LOG_LEVEL, RELAY_LOG_FORMAT, LEGACY_SERVER_URL.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Fallback legacy server when neither `legacy.base_url` nor `LEGACY_SERVER_URL` is set.
pub const DEFAULT_LEGACY_BASE_URL: &str = "http://localhost:8080";

/// Env var naming the legacy server base URL.
pub const LEGACY_SERVER_URL_ENV: &str = "LEGACY_SERVER_URL";

/// Config file picked up when `--config` is not given and the file exists.
pub const DEFAULT_CONFIG_PATH: &str = "relay.yaml";

/// Root config (relay.yaml).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub legacy: LegacyConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Log level (e.g. "info", "debug"). Env RELAY_LOG_LEVEL overrides when set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty". Env RELAY_LOG_FORMAT or RUST_LOG_JSON=1 override.
    #[serde(default)]
    pub log_format: Option<String>,

    #[serde(default)]
    pub metrics: Option<MetricsConfig>,

    #[serde(default)]
    pub audit: Option<AuditConfig>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: None,
            metrics: None,
            audit: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Serve GET /metrics on the relay listener.
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub log_credential_access: bool,
    #[serde(default = "default_true")]
    pub log_config_changes: bool,
    #[serde(default = "default_true")]
    pub redact_secrets: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_server_address")]
    pub address: String,
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Directory of the built front-end. When set, it is served behind the auth guard.
    #[serde(default)]
    pub static_dir: Option<PathBuf>,

    /// Where unauthenticated view requests are redirected.
    #[serde(default = "default_login_view")]
    pub login_view: String,

    /// Path prefixes served without a session (login assets, favicon, ...).
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
            port: default_server_port(),
            static_dir: None,
            login_view: default_login_view(),
            public_paths: default_public_paths(),
        }
    }
}

fn default_server_address() -> String {
    "127.0.0.1".to_string()
}
fn default_server_port() -> u16 {
    3000
}
fn default_login_view() -> String {
    "/login".to_string()
}
fn default_public_paths() -> Vec<String> {
    vec![
        "/login".to_string(),
        "/assets/".to_string(),
        "/favicon.ico".to_string(),
    ]
}

/// Legacy server contract: endpoints, form field names, cookie names.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LegacyConfig {
    /// Base URL of the legacy server. Falls back to env LEGACY_SERVER_URL, then the built-in default.
    #[serde(default)]
    pub base_url: Option<String>,

    /// HTML login page carrying the CSRF token (GET).
    #[serde(default = "default_login_page_path")]
    pub login_page_path: String,

    /// Form login endpoint (POST, form-urlencoded).
    #[serde(default = "default_auth_path")]
    pub auth_path: String,

    /// Optional legacy logout endpoint, called best-effort on logout.
    #[serde(default)]
    pub logout_path: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub fields: FormFields,

    #[serde(default)]
    pub cookies: CookieNames,

    /// Header carrying a duplicate of the CSRF token on proxied requests.
    #[serde(default = "default_csrf_header")]
    pub csrf_header: String,
}

impl Default for LegacyConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            login_page_path: default_login_page_path(),
            auth_path: default_auth_path(),
            logout_path: None,
            timeout_secs: default_timeout_secs(),
            fields: FormFields::default(),
            cookies: CookieNames::default(),
            csrf_header: default_csrf_header(),
        }
    }
}

fn default_login_page_path() -> String {
    "/login".to_string()
}
fn default_auth_path() -> String {
    "/j_spring_security_check".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_csrf_header() -> String {
    "X-CSRF-TOKEN".to_string()
}

impl LegacyConfig {
    /// Base URL without trailing slash: config value, else LEGACY_SERVER_URL, else the default.
    pub fn resolved_base_url(&self) -> String {
        let from_config = self
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let base = from_config
            .or_else(|| {
                std::env::var(LEGACY_SERVER_URL_ENV)
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
            })
            .unwrap_or_else(|| DEFAULT_LEGACY_BASE_URL.to_string());
        base.trim_end_matches('/').to_string()
    }

    /// Join the base URL and a backend path (leading slash optional).
    pub fn url_for(&self, path: &str) -> String {
        let base = self.resolved_base_url();
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }
}

/// Form field names the legacy login endpoint expects.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FormFields {
    #[serde(default = "default_username_field")]
    pub username: String,
    #[serde(default = "default_password_field")]
    pub password: String,
    #[serde(default = "default_remember_me_field")]
    pub remember_me: String,
    /// Also the attribute name searched for in the login page HTML.
    #[serde(default = "default_csrf_field")]
    pub csrf: String,
}

impl Default for FormFields {
    fn default() -> Self {
        Self {
            username: default_username_field(),
            password: default_password_field(),
            remember_me: default_remember_me_field(),
            csrf: default_csrf_field(),
        }
    }
}

fn default_username_field() -> String {
    "username".to_string()
}
fn default_password_field() -> String {
    "password".to_string()
}
fn default_remember_me_field() -> String {
    "remember-me".to_string()
}
fn default_csrf_field() -> String {
    "_csrf".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CookieNames {
    #[serde(default = "default_session_cookie")]
    pub session: String,
    #[serde(default = "default_csrf_cookie")]
    pub csrf: String,
}

impl Default for CookieNames {
    fn default() -> Self {
        Self {
            session: default_session_cookie(),
            csrf: default_csrf_cookie(),
        }
    }
}

fn default_session_cookie() -> String {
    "JSESSIONID".to_string()
}
fn default_csrf_cookie() -> String {
    "CSRF-TOKEN".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// "memory" | "file" | "sqlite"
    #[serde(default = "default_session_backend")]
    pub backend: String,
    /// Directory (file backend) or database file (sqlite backend).
    #[serde(default)]
    pub path: Option<String>,
    /// Storage key holding the serialized session record.
    #[serde(default = "default_session_key")]
    pub key: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: default_session_backend(),
            path: None,
            key: default_session_key(),
        }
    }
}

fn default_session_backend() -> String {
    "memory".to_string()
}
fn default_session_key() -> String {
    "mis_session".to_string()
}

impl Config {
    /// Load and parse config from path. Expands env vars (`$VAR`, `${VAR}`, `${VAR:-default}`) via shellexpand.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config {:?}", path))?;
        Self::parse(&s)
    }

    /// Parse YAML text (after env expansion) and validate.
    pub fn parse(yaml: &str) -> anyhow::Result<Self> {
        let expanded = expand_env_vars(yaml)?;
        let config: Config = if expanded.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml_ng::from_str(&expanded).map_err(|e| anyhow::anyhow!("parse config: {}", e))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Explicit path must exist; without one, use relay.yaml when present, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        let backend = self.session.backend.to_ascii_lowercase();
        match backend.as_str() {
            "memory" => {}
            "file" | "sqlite" => {
                if self.session.path.as_deref().is_none_or(|p| p.trim().is_empty()) {
                    anyhow::bail!("session.path is required when backend is {}", backend);
                }
            }
            other => anyhow::bail!("unknown session backend {:?} (memory, file, sqlite)", other),
        }
        if self.session.key.trim().is_empty() {
            anyhow::bail!("session.key must not be empty");
        }
        if self.legacy.cookies.session.trim().is_empty() || self.legacy.cookies.csrf.trim().is_empty() {
            anyhow::bail!("legacy.cookies names must not be empty");
        }
        if !self.server.login_view.starts_with('/') {
            anyhow::bail!("server.login_view must start with '/'");
        }
        if let Some(url) = self.legacy.base_url.as_deref()
            && !url.trim().is_empty()
        {
            reqwest::Url::parse(url.trim())
                .with_context(|| format!("legacy.base_url invalid: {:?}", url))?;
        }
        Ok(())
    }
}

/// Expand env vars in config: `$VAR`, `${VAR}`, `${VAR:-default}`. Unset vars expand to empty.
fn expand_env_vars(s: &str) -> anyhow::Result<String> {
    fn context(var: &str) -> Result<Option<std::borrow::Cow<'static, str>>, std::env::VarError> {
        match std::env::var(var) {
            Ok(v) => Ok(Some(v.into())),
            Err(std::env::VarError::NotPresent) => Ok(Some("".into())),
            Err(e) => Err(e),
        }
    }
    shellexpand::env_with_context(s, context)
        .map(|cow| cow.into_owned())
        .map_err(|e| anyhow::anyhow!("config env expansion: {} ({})", e.var_name, e.cause))
}
