//! Metric definitions for the gateway.
//!
//! Prometheus naming conventions:
//! - `gw_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! - `status`: success, refused, error
//! - `reason`: heartbeat_timeout, refresh_refused, token_error
//! - `kind`: queue, exchange, reply
//! - `type`: one per `GatewayError` variant
//! - `operation`: register, send, send_with_reply

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;

/// Install the Prometheus recorder and its HTTP scrape listener.
///
/// Must be called before any metrics are recorded. The sweep histogram uses
/// buckets sized around the default 10s sweep interval.
///
/// # Errors
///
/// Returns error if the bind address is invalid or a recorder is already
/// installed.
pub fn init_metrics_recorder(bind_address: &str) -> Result<(), String> {
    let addr: SocketAddr = bind_address
        .parse()
        .map_err(|e| format!("Invalid metrics bind address '{bind_address}': {e}"))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("gw_sweep_duration_seconds".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set sweep duration buckets: {e}"))?
        .install()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Session Metrics
// ============================================================================

/// Metric: `gw_sessions_active`
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("gw_sessions_active").set(count as f64);
}

/// Metric: `gw_sessions_removed_total`
pub fn record_session_removed() {
    counter!("gw_sessions_removed_total").increment(1);
}

/// Metric: `gw_session_closes_total`
/// Labels: `reason`
pub fn record_session_closed(reason: &'static str) {
    counter!("gw_session_closes_total", "reason" => reason).increment(1);
}

/// Metric: `gw_token_refresh_total`
/// Labels: `status` (success, refused, error)
pub fn record_token_refresh(status: &'static str) {
    counter!("gw_token_refresh_total", "status" => status).increment(1);
}

/// Metric: `gw_sweep_duration_seconds`
pub fn record_sweep_duration(duration: Duration) {
    histogram!("gw_sweep_duration_seconds").record(duration.as_secs_f64());
}

/// Metric: `gw_heartbeat_bulk_updates_total`
pub fn record_heartbeat_updates(rows: usize) {
    counter!("gw_heartbeat_bulk_updates_total").increment(rows as u64);
}

// ============================================================================
// Broker Metrics
// ============================================================================

/// Metric: `gw_pending_calls`
///
/// Pending calls never expire on their own; a steadily climbing value means
/// replies are being lost somewhere between peers.
pub fn set_pending_calls(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("gw_pending_calls").set(count as f64);
}

/// Metric: `gw_broker_connected`
pub fn set_broker_connected(connected: bool) {
    gauge!("gw_broker_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Metric: `gw_broker_reconnects_total`
pub fn record_reconnect_scheduled() {
    counter!("gw_broker_reconnects_total").increment(1);
}

/// Metric: `gw_queue_messages_total`
/// Labels: `kind` (queue, exchange, reply)
pub fn record_queue_message(kind: &'static str) {
    counter!("gw_queue_messages_total", "kind" => kind).increment(1);
}

/// Metric: `gw_returned_messages_total`
pub fn record_returned_message() {
    counter!("gw_returned_messages_total").increment(1);
}

/// Metric: `gw_access_denied_total`
pub fn record_access_denied() {
    counter!("gw_access_denied_total").increment(1);
}

/// Metric: `gw_errors_total`
/// Labels: `operation`, `type`
pub fn record_error(operation: &'static str, error_type: &'static str) {
    counter!("gw_errors_total", "operation" => operation, "type" => error_type).increment(1);
}

/// Metric: `gw_consumers_active`
/// Labels: `kind` (queue, exchange)
pub fn set_consumers_active(kind: &'static str, count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("gw_consumers_active", "kind" => kind).set(count as f64);
}
