//! Metrics collection and exposition.
//!
//! # Metrics
//! - `tunnelgate_connect_requests_total` (counter): CONNECT requests by `policy`
//! - `tunnelgate_dial_failures_total` (counter): failed upstream dials
//! - `tunnelgate_relay_bytes_total` (counter): relayed bytes by `direction`
//! - `tunnelgate_relay_errors_total` (counter): non-benign relay errors by `direction`
//! - `tunnelgate_active_connections` (gauge): open downstream connections
//!
//! # Design Decisions
//! - The Prometheus exporter is optional; without it every update is a no-op
//! - Directions are `upstream` (client to origin) and `downstream` (origin to client)

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connect(policy: &str) {
    metrics::counter!("tunnelgate_connect_requests_total", "policy" => policy.to_string())
        .increment(1);
}

pub fn record_dial_failure() {
    metrics::counter!("tunnelgate_dial_failures_total").increment(1);
}

pub fn record_relay_bytes(direction: &str, bytes: u64) {
    if bytes > 0 {
        metrics::counter!("tunnelgate_relay_bytes_total", "direction" => direction.to_string())
            .increment(bytes);
    }
}

pub fn record_relay_error(direction: &str) {
    metrics::counter!("tunnelgate_relay_errors_total", "direction" => direction.to_string())
        .increment(1);
}

pub fn connection_opened() {
    metrics::gauge!("tunnelgate_active_connections").increment(1.0);
}

pub fn connection_closed() {
    metrics::gauge!("tunnelgate_active_connections").decrement(1.0);
}
