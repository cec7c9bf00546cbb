//! Prometheus metrics recorder and metric names.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder and describe the relay's metrics.
///
/// Returns the handle used to render `/metrics`. Call once at startup.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Register help text for every relay metric.
pub fn describe_metrics() {
    describe_counter!(WS_CONNECTIONS_TOTAL, "WebSocket connections accepted");
    describe_gauge!(WS_CONNECTIONS_ACTIVE, "WebSocket connections currently registered");
    describe_counter!(WS_REJECTED_TOTAL, "Upgrade requests refused before the handshake");
    describe_counter!(WS_WRITE_TIMEOUTS_TOTAL, "Connections closed by a write deadline");
    describe_histogram!(WS_CONNECTION_DURATION_SECONDS, "WebSocket connection lifetime");
    describe_counter!(ENVELOPES_PUBLISHED_TOTAL, "Envelopes accepted by the broadcaster");
    describe_counter!(BROADCAST_DROPS_TOTAL, "Envelopes dropped on a full broadcast queue");
    describe_counter!(ENVELOPES_FANNED_OUT_TOTAL, "Envelope copies queued to connections");
    describe_counter!(DELIVERY_DROPS_TOTAL, "Envelope copies dropped on a full connection queue");
}

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "relay_ws_connections_total";
/// Registered WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "relay_ws_connections_active";
/// Refused upgrades (counter, labels: reason).
pub const WS_REJECTED_TOTAL: &str = "relay_ws_rejected_total";
/// Connections ended by a write deadline (counter).
pub const WS_WRITE_TIMEOUTS_TOTAL: &str = "relay_ws_write_timeouts_total";
/// Connection lifetime seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "relay_ws_connection_duration_seconds";
/// Envelopes accepted into the broadcast queue (counter).
pub const ENVELOPES_PUBLISHED_TOTAL: &str = "relay_envelopes_published_total";
/// Envelopes dropped at the broadcast queue (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "relay_broadcast_drops_total";
/// Envelope copies queued to connections (counter).
pub const ENVELOPES_FANNED_OUT_TOTAL: &str = "relay_envelopes_fanned_out_total";
/// Envelope copies dropped at a connection queue (counter).
pub const DELIVERY_DROPS_TOTAL: &str = "relay_delivery_drops_total";
