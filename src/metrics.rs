//! Prometheus metrics: login outcomes, proxied requests, upstream latency, CSRF rotations,
//! session self-heals. When global.metrics.enabled, GET /metrics exposes text format.

use once_cell::sync::OnceCell;
use prometheus::{Encoder, HistogramVec, IntCounter, IntCounterVec, Opts, TextEncoder};

static METRICS: OnceCell<MetricsInner> = OnceCell::new();

struct MetricsInner {
    login_attempts_total: IntCounterVec,
    proxy_requests_total: IntCounterVec,
    upstream_duration_seconds: HistogramVec,
    csrf_rotations_total: IntCounter,
    session_self_heal_total: IntCounter,
}

/// Initialize metrics and register with the default registry. Call once when metrics are enabled.
pub fn init() -> Result<(), prometheus::Error> {
    let login_attempts_total = IntCounterVec::new(
        Opts::new(
            "relay_login_attempts_total",
            "Login relay attempts by outcome",
        ),
        &["outcome"],
    )?;
    let proxy_requests_total = IntCounterVec::new(
        Opts::new(
            "relay_proxy_requests_total",
            "Proxied requests by method and backend status class",
        ),
        &["method", "status_class"],
    )?;
    let upstream_duration_seconds = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "relay_upstream_duration_seconds",
            "Legacy server call duration in seconds by operation",
        )
        .buckets(prometheus::exponential_buckets(0.01, 2.0, 12)?),
        &["operation"],
    )?;
    let csrf_rotations_total = IntCounter::new(
        "relay_csrf_rotations_total",
        "CSRF tokens adopted from backend Set-Cookie",
    )?;
    let session_self_heal_total = IntCounter::new(
        "relay_session_self_heal_total",
        "Corrupt stored sessions cleared on read",
    )?;

    prometheus::register(Box::new(login_attempts_total.clone()))?;
    prometheus::register(Box::new(proxy_requests_total.clone()))?;
    prometheus::register(Box::new(upstream_duration_seconds.clone()))?;
    prometheus::register(Box::new(csrf_rotations_total.clone()))?;
    prometheus::register(Box::new(session_self_heal_total.clone()))?;

    let _ = METRICS.set(MetricsInner {
        login_attempts_total,
        proxy_requests_total,
        upstream_duration_seconds,
        csrf_rotations_total,
        session_self_heal_total,
    });
    Ok(())
}

/// outcome: "redirect", "success_marker", "ambiguous", "rejected", "csrf_missing", "error".
pub fn record_login(outcome: &str) {
    if let Some(m) = METRICS.get() {
        m.login_attempts_total.with_label_values(&[outcome]).inc();
    }
}

/// status_class: "2xx".."5xx", or "error" when the backend was unreachable.
pub fn record_proxy_request(method: &str, status_class: &str) {
    if let Some(m) = METRICS.get() {
        m.proxy_requests_total
            .with_label_values(&[method, status_class])
            .inc();
    }
}

pub fn record_upstream_duration(operation: &str, duration_secs: f64) {
    if let Some(m) = METRICS.get() {
        m.upstream_duration_seconds
            .with_label_values(&[operation])
            .observe(duration_secs);
    }
}

pub fn record_csrf_rotation() {
    if let Some(m) = METRICS.get() {
        m.csrf_rotations_total.inc();
    }
}

pub fn record_session_self_heal() {
    if let Some(m) = METRICS.get() {
        m.session_self_heal_total.inc();
    }
}

/// "2xx", "3xx", "4xx", "5xx" (or "1xx").
pub fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

/// Encode all metrics in Prometheus text format. Returns empty string if metrics not initialized.
pub fn encode() -> String {
    if METRICS.get().is_none() {
        return String::new();
    }
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&families, &mut buffer).is_ok() {
        String::from_utf8_lossy(&buffer).into_owned()
    } else {
        String::new()
    }
}
