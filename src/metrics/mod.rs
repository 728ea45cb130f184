//! Metrics module
//!
//! Prometheus counters for the upload protocol, exposed in text format on
//! `GET /metrics` of the main server.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, register_int_gauge, Counter,
    CounterVec, Encoder, HistogramVec, IntGauge, TextEncoder,
};

lazy_static! {
    // Request metrics
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "resumable_requests_total",
        "Protocol requests by operation and status class",
        &["operation", "status"]
    ).unwrap();

    pub static ref REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "resumable_request_duration_seconds",
        "Request duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0]
    ).unwrap();

    // Session metrics
    pub static ref SESSIONS_CREATED: CounterVec = register_counter_vec!(
        "resumable_sessions_created_total",
        "Upload sessions created by concatenation role",
        &["role"]
    ).unwrap();

    pub static ref ACTIVE_SESSIONS: IntGauge = register_int_gauge!(
        "resumable_active_sessions",
        "Upload sessions currently tracked"
    ).unwrap();

    pub static ref SESSIONS_EXPIRED: Counter = register_counter!(
        "resumable_sessions_expired_total",
        "Idle sessions evicted by the sweeper"
    ).unwrap();

    pub static ref SESSIONS_TERMINATED: Counter = register_counter!(
        "resumable_sessions_terminated_total",
        "Sessions aborted by the client"
    ).unwrap();

    pub static ref BYTES_RECEIVED: Counter = register_counter!(
        "resumable_bytes_received_total",
        "Upload bytes durably appended"
    ).unwrap();

    pub static ref OFFSET_MISMATCHES: Counter = register_counter!(
        "resumable_offset_mismatches_total",
        "Appends rejected for a stale offset"
    ).unwrap();

    // Completion metrics
    pub static ref UPLOADS_COMPLETED: Counter = register_counter!(
        "resumable_uploads_completed_total",
        "Uploads that received all their bytes"
    ).unwrap();

    pub static ref COMPLETED_BYTES: Counter = register_counter!(
        "resumable_completed_bytes_total",
        "Bytes in completed uploads"
    ).unwrap();

    pub static ref DISPATCH_DURATION: HistogramVec = register_histogram_vec!(
        "resumable_dispatch_duration_seconds",
        "Completion dispatch duration by outcome",
        &["outcome"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();

    // Auth metrics
    pub static ref AUTH_ATTEMPTS: CounterVec = register_counter_vec!(
        "resumable_auth_attempts_total",
        "Authentication attempts",
        &["method", "status"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "resumable_errors_total",
        "Total errors",
        &["type"]
    ).unwrap();
}

/// Record a finished request
pub fn record_request(operation: &str, status: u16, duration_secs: f64) {
    let class = match status {
        200..=299 => "2xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    };
    REQUESTS_TOTAL.with_label_values(&[operation, class]).inc();
    REQUEST_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}

/// Record a new session
pub fn record_session_created(role: &str) {
    SESSIONS_CREATED.with_label_values(&[role]).inc();
}

pub fn set_active_sessions(count: usize) {
    ACTIVE_SESSIONS.set(count as i64);
}

pub fn record_sessions_expired(count: usize) {
    SESSIONS_EXPIRED.inc_by(count as f64);
}

pub fn record_terminated() {
    SESSIONS_TERMINATED.inc();
}

/// Record bytes made durable by an append
pub fn record_bytes_received(bytes: u64) {
    BYTES_RECEIVED.inc_by(bytes as f64);
}

pub fn record_offset_mismatch() {
    OFFSET_MISMATCHES.inc();
}

/// Record an upload reaching its declared length
pub fn record_upload_completed(bytes: u64) {
    UPLOADS_COMPLETED.inc();
    COMPLETED_BYTES.inc_by(bytes as f64);
}

/// Record a dispatch outcome ("success" or "failure")
pub fn record_dispatch(outcome: &str, duration_secs: f64) {
    DISPATCH_DURATION
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

/// Record authentication attempt
pub fn record_auth_attempt(method: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    AUTH_ATTEMPTS.with_label_values(&[method, status]).inc();
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Render every registered metric in the Prometheus text format.
///
/// Returns the content type alongside the body.
pub fn render() -> Result<(String, Vec<u8>), prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}
