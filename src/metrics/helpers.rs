//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    CONNECTION_STATE, EVENTS_RECEIVED_TOTAL, FRAMES_MALFORMED_TOTAL, HANDLER_FAILURES_TOTAL,
    HANDSHAKES_TOTAL, OPTIMISTIC_MUTATIONS_TOTAL, PAGE_LOADS_TOTAL, SESSIONS_DROPPED_TOTAL,
    UNREAD_COUNT, UNREAD_REFRESH_TOTAL, VIDEO_STATUS_APPLIED_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

fn outcome(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "error"
    }
}

/// Helper struct for recording connection metrics
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn set_state(code: i64) {
        CONNECTION_STATE.set(code);
    }

    pub fn record_handshake_ok() {
        HANDSHAKES_TOTAL.with_label_values(&["ok"]).inc();
    }

    pub fn record_handshake_transient() {
        HANDSHAKES_TOTAL.with_label_values(&["transient"]).inc();
    }

    pub fn record_handshake_auth_rejected() {
        HANDSHAKES_TOTAL.with_label_values(&["auth_rejected"]).inc();
    }

    pub fn record_session_dropped() {
        SESSIONS_DROPPED_TOTAL.inc();
    }
}

/// Helper struct for recording dispatch metrics
pub struct DispatchMetrics;

impl DispatchMetrics {
    pub fn record_received(event: &str) {
        EVENTS_RECEIVED_TOTAL.with_label_values(&[event]).inc();
    }

    pub fn record_handler_failures(event: &str, count: u64) {
        HANDLER_FAILURES_TOTAL.with_label_values(&[event]).inc_by(count);
    }

    pub fn record_malformed_frame() {
        FRAMES_MALFORMED_TOTAL.inc();
    }
}

/// Helper struct for recording notification metrics
pub struct NotificationMetrics;

impl NotificationMetrics {
    pub fn record_unread_refresh(trigger: &str, ok: bool) {
        UNREAD_REFRESH_TOTAL
            .with_label_values(&[trigger, outcome(ok)])
            .inc();
    }

    pub fn set_unread_count(count: u64) {
        UNREAD_COUNT.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn record_page_load(ok: bool) {
        PAGE_LOADS_TOTAL.with_label_values(&[outcome(ok)]).inc();
    }

    pub fn record_mutation(kind: &str, ok: bool) {
        OPTIMISTIC_MUTATIONS_TOTAL
            .with_label_values(&[kind, outcome(ok)])
            .inc();
    }
}

/// Helper struct for recording video metrics
pub struct VideoMetrics;

impl VideoMetrics {
    pub fn record_status_applied() {
        VIDEO_STATUS_APPLIED_TOTAL.inc();
    }
}
