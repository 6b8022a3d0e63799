//! session-relay: session relay in front of a cookie + CSRF legacy server.
//!
//! Logs in on the browser's behalf, keeps the resulting session in a single-slot store,
//! forwards data requests with the session attached, and guards protected views.

use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod audit;
mod client;
mod config;
mod cookies;
mod error;
mod guard;
mod health;
mod login;
mod metrics;
mod mock_server;
mod proxy;
mod session;

use anyhow::Context;
use api::AppState;
use config::Config;

#[derive(Parser)]
#[command(name = "session-relay")]
#[command(author, version, about = "Session relay for a cookie + CSRF legacy server")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP relay (default)
    Serve {
        /// Config file path (default relay.yaml when present)
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate {
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Log in once, print the login response and persist the session
    Login {
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long)]
        username: String,

        /// Environment variable holding the password
        #[arg(long, default_value = "RELAY_PASSWORD", value_name = "VAR")]
        password_env: String,
    },

    /// Inspect or manage the persisted session
    Session {
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,

        #[command(subcommand)]
        subcommand: SessionSubcommand,
    },

    /// Run the YAML-driven mock legacy server
    MockLegacy {
        #[arg(short, long, value_name = "PATH")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum SessionSubcommand {
    /// Print the stored session as JSON
    Show,
    /// Remove the stored session
    Clear,
    /// Replace the stored CSRF token (bare token or `CSRF-TOKEN=...` cookie string)
    SetCsrf { token: String },
}

/// Ignore SIGPIPE so writes to a broken pipe return EPIPE instead of killing the process.
#[cfg(unix)]
fn ignore_sigpipe() {
    unsafe {
        let _ = nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        );
    }
}
#[cfg(not(unix))]
fn ignore_sigpipe() {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    ignore_sigpipe();

    match &cli.command {
        Some(Commands::Validate { config }) => {
            init_logging(None, &cli);
            run_validate(config.as_deref())
        }
        Some(Commands::MockLegacy { config }) => {
            init_logging(None, &cli);
            mock_server::run_mock_server(config).await
        }
        other => {
            let config_path = match other {
                Some(Commands::Serve { config })
                | Some(Commands::Login { config, .. })
                | Some(Commands::Session { config, .. }) => config.clone(),
                _ => None,
            };
            let config = Config::load_or_default(config_path.as_deref())?;
            init_logging(Some(&config), &cli);
            audit::log_config_load(config.global.audit.as_ref(), config_path.as_deref());
            match other {
                Some(Commands::Login {
                    username,
                    password_env,
                    ..
                }) => run_login(config, username, password_env).await,
                Some(Commands::Session { subcommand, .. }) => run_session(config, subcommand).await,
                _ => run_server(config).await,
            }
        }
    }
}

/// Producer label added to every JSON log line.
const LOG_LABEL_KEY: &str = "source";
const LOG_LABEL_VALUE: &str = "session-relay";

/// Post-process a JSON log line: add the producer label, rename "target" to "module".
fn add_source_to_json_log_line(line: &str) -> String {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return line.to_string();
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(mut v) => {
            if let Some(obj) = v.as_object_mut() {
                obj.insert(
                    LOG_LABEL_KEY.to_string(),
                    serde_json::Value::String(LOG_LABEL_VALUE.to_string()),
                );
                if let Some(t) = obj.remove("target") {
                    obj.insert("module".to_string(), t);
                }
            }
            let out = serde_json::to_string(&v).unwrap_or_else(|_| line.to_string());
            if line.ends_with('\n') {
                out + "\n"
            } else {
                out
            }
        }
        Err(_) => line.to_string(),
    }
}

/// Buffers stderr until newline, then labels JSON lines before writing.
struct JsonSourceLabelWriter {
    buffer: Vec<u8>,
}

impl JsonSourceLabelWriter {
    fn new() -> Self {
        Self { buffer: Vec::new() }
    }
}

impl Write for JsonSourceLabelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        let mut stderr = std::io::stderr().lock();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line_str = String::from_utf8_lossy(&line);
            let out = add_source_to_json_log_line(&line_str);
            stderr.write_all(out.as_bytes())?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut stderr = std::io::stderr().lock();
        if !self.buffer.is_empty() {
            let line_str = String::from_utf8_lossy(&self.buffer).into_owned();
            self.buffer.clear();
            let out = add_source_to_json_log_line(&line_str);
            stderr.write_all(out.as_bytes())?;
        }
        stderr.flush()
    }
}

static RELAY_JSON_WRITER: once_cell::sync::Lazy<Mutex<JsonSourceLabelWriter>> =
    once_cell::sync::Lazy::new(|| Mutex::new(JsonSourceLabelWriter::new()));

/// MakeWriter for the labelled JSON stderr stream.
#[derive(Clone)]
struct RelayJsonStderr;

impl Write for RelayJsonStderr {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        RELAY_JSON_WRITER
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        RELAY_JSON_WRITER
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .flush()
    }
}

impl tracing_subscriber::fmt::MakeWriter<'_> for RelayJsonStderr {
    type Writer = RelayJsonStderr;
    fn make_writer(&self) -> Self::Writer {
        RelayJsonStderr
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Init tracing. Config log_format/log_level apply; RELAY_LOG_FORMAT, RUST_LOG_JSON=1 and
/// RELAY_LOG_LEVEL override them, RUST_LOG is honoured when there is no config.
fn init_logging(config: Option<&Config>, cli: &Cli) {
    let use_json = match non_empty_env("RELAY_LOG_FORMAT").as_deref() {
        Some(format) => format == "json",
        None => {
            std::env::var("RUST_LOG_JSON").as_deref() == Ok("1")
                || config.and_then(|c| c.global.log_format.as_deref()) == Some("json")
        }
    };
    let filter = if cli.quiet {
        EnvFilter::new("error")
    } else if cli.verbose {
        EnvFilter::new("session_relay=debug,tower_http=debug")
    } else {
        let level = match config {
            Some(c) => non_empty_env("RELAY_LOG_LEVEL").unwrap_or_else(|| c.global.log_level.clone()),
            None => non_empty_env("RUST_LOG").unwrap_or_else(|| "info".to_string()),
        };
        let filter_str = format!("session_relay={}", level);
        if config.is_some() {
            EnvFilter::new(filter_str)
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_str))
        }
    };
    if use_json {
        // Span fields are key=value text, not JSON; keep them out of the line.
        let json_fmt = tracing_subscriber::fmt::format()
            .json()
            .with_current_span(false)
            .with_span_list(false);
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(RelayJsonStderr)
                    .with_ansi(false)
                    .event_format(json_fmt),
            )
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .with(filter)
            .init();
    }
}

fn run_validate(config_path: Option<&Path>) -> anyhow::Result<()> {
    match Config::load_or_default(config_path) {
        Ok(_) => {
            tracing::info!("config valid");
            std::process::exit(0);
        }
        Err(e) => {
            tracing::error!("config invalid: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    if config.global.metrics.as_ref().is_some_and(|m| m.enabled) {
        if let Err(e) = metrics::init() {
            tracing::warn!("metrics init failed: {}", e);
        } else {
            tracing::info!("metrics enabled on GET /metrics");
        }
    }

    let state = Arc::new(AppState::from_config(config)?);
    let server = state.config.server.clone();
    let mut app = api::router(state.clone());
    if let Some(dir) = &server.static_dir {
        tracing::info!(dir = %dir.display(), login_view = %server.login_view, "serving guarded front-end");
        let guard_state = guard::GuardState {
            server: Arc::new(server.clone()),
            store: state.store.clone(),
        };
        app = app.merge(guard::static_router(dir, guard_state));
    }

    let listener = tokio::net::TcpListener::bind((server.address.as_str(), server.port))
        .await
        .with_context(|| format!("bind {}:{}", server.address, server.port))?;
    let addr = listener.local_addr().context("relay local_addr")?;
    tracing::info!(
        %addr,
        legacy = %state.config.legacy.resolved_base_url(),
        session_backend = state.store.backend(),
        "session relay listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve relay")?;
    tracing::info!("graceful shutdown complete");
    Ok(())
}

async fn run_login(config: Config, username: &str, password_env: &str) -> anyhow::Result<()> {
    let password = std::env::var(password_env)
        .with_context(|| format!("password environment variable {} is not set", password_env))?;
    if config.session.backend.eq_ignore_ascii_case("memory") {
        tracing::warn!("session backend is memory; the session will not outlive this command");
    }
    let state = AppState::from_config(config)?;
    match api::perform_login(&state, username, &password).await {
        Ok((_, response)) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Err(e) => {
            let body = serde_json::json!({ "success": false, "message": e.to_string() });
            println!("{}", serde_json::to_string_pretty(&body)?);
            tracing::error!(error = %e, "login failed");
            std::process::exit(1);
        }
    }
}

async fn run_session(config: Config, subcommand: &SessionSubcommand) -> anyhow::Result<()> {
    let storage = session::open_storage(&config.session)?;
    let store = session::SessionStore::new(storage, &config.session.key, &config.legacy.cookies.csrf);
    match subcommand {
        SessionSubcommand::Show => match store.get().await {
            Some(record) => {
                let redacted = audit::redact_secret(config.global.audit.as_ref(), &record.session_id)
                    .into_owned();
                let shown = session::SessionRecord {
                    session_id: redacted,
                    ..record
                };
                println!("{}", serde_json::to_string_pretty(&shown)?);
            }
            None => println!("no session"),
        },
        SessionSubcommand::Clear => {
            store.clear().await?;
            println!("session cleared");
        }
        SessionSubcommand::SetCsrf { token } => {
            if store.get().await.is_none() {
                println!("no session; nothing to update");
            } else {
                store.update_csrf_token(token).await?;
                println!("csrf token updated");
            }
        }
    }
    Ok(())
}

/// Completes when SIGINT (Ctrl+C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_source_to_json_log_line() {
        let line = r#"{"timestamp":"2024-01-15T12:00:00Z","level":"INFO","target":"session_relay::proxy","message":"started"}"#;
        let out = add_source_to_json_log_line(line);
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v.get("source").and_then(|s| s.as_str()), Some("session-relay"));
        assert_eq!(v.get("message").and_then(|s| s.as_str()), Some("started"));
        assert!(v.get("target").is_none(), "target should be renamed to module");
        assert_eq!(
            v.get("module").and_then(|s| s.as_str()),
            Some("session_relay::proxy")
        );
    }

    #[test]
    fn test_add_source_to_json_log_line_non_json_unchanged() {
        let line = "not json\n";
        assert_eq!(add_source_to_json_log_line(line), "not json\n");
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["session-relay", "login", "--username", "kim"]).unwrap();
        match cli.command {
            Some(Commands::Login {
                username,
                password_env,
                ..
            }) => {
                assert_eq!(username, "kim");
                assert_eq!(password_env, "RELAY_PASSWORD");
            }
            _ => panic!("expected login"),
        }
        let cli = Cli::try_parse_from(["session-relay", "session", "set-csrf", "tok9"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Session {
                subcommand: SessionSubcommand::SetCsrf { .. },
                ..
            })
        ));
        let cli = Cli::try_parse_from(["session-relay", "-q"]).unwrap();
        assert!(cli.quiet && cli.command.is_none());
    }
}
