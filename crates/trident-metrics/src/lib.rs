//! Metrics instrumentation for the tunnel stack.
//!
//! Counters are process-wide atomics behind the `metrics` facade; the
//! Prometheus exporter is installed when the management endpoint is
//! enabled. Recording is always cheap, whether or not an exporter exists.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on `listen`.
pub fn init_prometheus(listen: &str) -> Result<(), String> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| format!("invalid metrics listen address: {e}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install prometheus exporter: {e}"))?;
    Ok(())
}

/// Total TCP connections accepted by the inbound stack.
pub const CONNECTIONS_TOTAL: &str = "trident_connections_total";
/// Currently active relayed connections.
pub const CONNECTIONS_ACTIVE: &str = "trident_connections_active";
/// Successful trojan authentications.
pub const AUTH_SUCCESS_TOTAL: &str = "trident_auth_success_total";
/// Failed trojan authentications (these are redirected, never surfaced).
pub const AUTH_FAILURE_TOTAL: &str = "trident_auth_failure_total";
/// Connections handed to the redirection worker.
pub const REDIRECTIONS_TOTAL: &str = "trident_redirections_total";
/// Redirection requests dropped because the queue was full.
pub const REDIRECTIONS_DROPPED_TOTAL: &str = "trident_redirections_dropped_total";
/// Bytes copied inbound → outbound.
pub const BYTES_TX_TOTAL: &str = "trident_bytes_tx_total";
/// Bytes copied outbound → inbound.
pub const BYTES_RX_TOTAL: &str = "trident_bytes_rx_total";
/// UDP packets relayed, labeled by direction.
pub const UDP_PACKETS_TOTAL: &str = "trident_udp_packets_total";
/// Streams blocked by the router.
pub const ROUTER_BLOCKED_TOTAL: &str = "trident_router_blocked_total";

#[inline]
pub fn record_connection_open() {
    counter!(CONNECTIONS_TOTAL).increment(1);
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

#[inline]
pub fn record_connection_close() {
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

#[inline]
pub fn record_auth_success() {
    counter!(AUTH_SUCCESS_TOTAL).increment(1);
}

#[inline]
pub fn record_auth_failure() {
    counter!(AUTH_FAILURE_TOTAL).increment(1);
}

#[inline]
pub fn record_redirection() {
    counter!(REDIRECTIONS_TOTAL).increment(1);
}

#[inline]
pub fn record_redirection_dropped() {
    counter!(REDIRECTIONS_DROPPED_TOTAL).increment(1);
}

#[inline]
pub fn record_bytes_tx(bytes: u64) {
    counter!(BYTES_TX_TOTAL).increment(bytes);
}

#[inline]
pub fn record_bytes_rx(bytes: u64) {
    counter!(BYTES_RX_TOTAL).increment(bytes);
}

#[inline]
pub fn record_udp_packet(direction: &'static str) {
    counter!(UDP_PACKETS_TOTAL, "direction" => direction).increment(1);
}

#[inline]
pub fn record_router_blocked() {
    counter!(ROUTER_BLOCKED_TOTAL).increment(1);
}
