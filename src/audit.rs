//! Optional audit: log credential use and config loads; redact secrets in logs.
//!
//! When `global.audit.enabled` is true:
//! - `log_credential_access`: log login attempts (username and outcome); never the password.
//! - `log_config_changes`: log when config is loaded.
//! - `redact_secrets`: use [REDACTED] instead of session ids and tokens in log messages.

use crate::config::AuditConfig;
use std::borrow::Cow;

/// Log a credential exchange for the given user. Never logs the password.
pub fn log_credential_access(audit: Option<&AuditConfig>, username: &str, outcome: &str) {
    let Some(a) = audit else { return };
    if !a.enabled || !a.log_credential_access {
        return;
    }
    tracing::info!(
        username = %username,
        outcome = %outcome,
        "audit: credentials relayed to legacy server"
    );
}

/// Log that config was loaded (path only; no secret content).
pub fn log_config_load(audit: Option<&AuditConfig>, path: Option<&std::path::Path>) {
    let Some(a) = audit else { return };
    if !a.enabled || !a.log_config_changes {
        return;
    }
    match path {
        Some(p) => tracing::info!(path = %p.display(), "audit: config loaded"),
        None => tracing::info!("audit: built-in default config loaded"),
    }
}

/// Return value for logging: [REDACTED] when redact_secrets is true, else the actual value.
#[must_use]
pub fn redact_secret<'a>(audit: Option<&AuditConfig>, value: &'a str) -> Cow<'a, str> {
    match audit {
        Some(a) if a.enabled && a.redact_secrets => Cow::Borrowed("[REDACTED]"),
        _ => Cow::Borrowed(value),
    }
}

/// Session ids are bearer credentials; log lines only ever carry a short prefix.
#[must_use]
pub fn mask_session_id(session_id: &str) -> String {
    let prefix: String = session_id.chars().take(4).collect();
    if session_id.chars().count() >= 8 {
        format!("{}***", prefix)
    } else {
        "***".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audit(enabled: bool, redact: bool) -> AuditConfig {
        AuditConfig {
            enabled,
            log_credential_access: true,
            log_config_changes: true,
            redact_secrets: redact,
        }
    }

    #[test]
    fn redacts_only_when_enabled() {
        assert_eq!(redact_secret(Some(&audit(true, true)), "abcd"), "[REDACTED]");
        assert_eq!(redact_secret(Some(&audit(false, true)), "abcd"), "abcd");
        assert_eq!(redact_secret(Some(&audit(true, false)), "abcd"), "abcd");
        assert_eq!(redact_secret(None, "abcd"), "abcd");
    }

    #[test]
    fn session_id_masked_without_audit_config() {
        assert_eq!(mask_session_id("0123456789ABCDEF"), "0123***");
        assert_eq!(mask_session_id("abcd"), "***");
        assert_eq!(mask_session_id(""), "***");
        assert!(!mask_session_id("0123456789ABCDEF").contains("89AB"));
    }
}
