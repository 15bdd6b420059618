//! Prometheus metrics for the sync layer.
//!
//! - Connection metrics (state, handshake outcomes, reconnects)
//! - Dispatch metrics (events received, handler failures, malformed frames)
//! - Notification metrics (unread refreshes by trigger, page loads, optimistic mutations)
//! - Video status metrics

mod helpers;

pub use helpers::{
    encode_metrics, ConnectionMetrics, DispatchMetrics, NotificationMetrics, VideoMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara_sync";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Current connection state (0=disconnected, 1=connecting, 2=connected, 3=reconnecting)
    pub static ref CONNECTION_STATE: IntGauge = register_int_gauge!(
        format!("{}_connection_state", METRIC_PREFIX),
        "Current push channel state (0=disconnected, 1=connecting, 2=connected, 3=reconnecting)"
    ).unwrap();

    /// Handshake attempts by outcome
    pub static ref HANDSHAKES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_handshakes_total", METRIC_PREFIX),
        "Push channel handshake attempts",
        &["outcome"]
    ).unwrap();

    /// Established sessions that were lost
    pub static ref SESSIONS_DROPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_sessions_dropped_total", METRIC_PREFIX),
        "Established push sessions that dropped"
    ).unwrap();

    // ============================================================================
    // Dispatch Metrics
    // ============================================================================

    /// Events dispatched by name
    pub static ref EVENTS_RECEIVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_events_received_total", METRIC_PREFIX),
        "Events dispatched to handlers",
        &["event"]
    ).unwrap();

    /// Handler failures (errors and panics) by event name
    pub static ref HANDLER_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_handler_failures_total", METRIC_PREFIX),
        "Event handler failures",
        &["event"]
    ).unwrap();

    /// Frames that could not be decoded into events
    pub static ref FRAMES_MALFORMED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_frames_malformed_total", METRIC_PREFIX),
        "Inbound frames that could not be decoded"
    ).unwrap();

    // ============================================================================
    // Notification Metrics
    // ============================================================================

    /// Last applied unread count
    pub static ref UNREAD_COUNT: IntGauge = register_int_gauge!(
        format!("{}_unread_count", METRIC_PREFIX),
        "Last applied unread counter value"
    ).unwrap();

    /// Unread counter refreshes by trigger and outcome
    pub static ref UNREAD_REFRESH_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_unread_refresh_total", METRIC_PREFIX),
        "Unread counter refreshes",
        &["trigger", "outcome"]
    ).unwrap();

    /// Page loads by outcome
    pub static ref PAGE_LOADS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_page_loads_total", METRIC_PREFIX),
        "Notification page loads",
        &["outcome"]
    ).unwrap();

    /// Optimistic mutations by kind and request outcome
    pub static ref OPTIMISTIC_MUTATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_optimistic_mutations_total", METRIC_PREFIX),
        "Optimistic read-flag mutations",
        &["kind", "outcome"]
    ).unwrap();

    // ============================================================================
    // Video Metrics
    // ============================================================================

    /// Video status events applied to a projector
    pub static ref VIDEO_STATUS_APPLIED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_video_status_applied_total", METRIC_PREFIX),
        "Video status events applied to a projector"
    ).unwrap();
}
