//! Observability for the gateway.
//!
//! Logs go through `tracing` with literal `gw.*` targets. Metrics use the
//! `metrics` facade and are exported in Prometheus text format.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `gw_sessions_active` | Gauge | none | Registered client sessions |
//! | `gw_sessions_removed_total` | Counter | none | Sessions pruned by the sweep |
//! | `gw_session_closes_total` | Counter | `reason` | Sessions closed by the sweep |
//! | `gw_token_refresh_total` | Counter | `status` | Sweep token refresh outcomes |
//! | `gw_sweep_duration_seconds` | Histogram | none | Duration of one sweep |
//! | `gw_heartbeat_bulk_updates_total` | Counter | none | Heartbeat rows written |
//! | `gw_pending_calls` | Gauge | none | Outstanding request/reply calls |
//! | `gw_broker_connected` | Gauge | none | 1 while connected to the broker |
//! | `gw_broker_reconnects_total` | Counter | none | Scheduled reconnect attempts |
//! | `gw_queue_messages_total` | Counter | `kind` | Delivered messages |
//! | `gw_returned_messages_total` | Counter | none | Mandatory messages bounced |
//! | `gw_access_denied_total` | Counter | none | Queue registrations refused |
//! | `gw_consumers_active` | Gauge | `kind` | Registered queue/exchange consumers |

pub mod metrics;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use metrics::init_metrics_recorder;

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG`; falls back to `flow_gateway=info`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing() -> Result<(), String> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flow_gateway=info,common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| format!("Failed to install tracing subscriber: {e}"))
}
