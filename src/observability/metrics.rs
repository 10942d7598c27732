//! Metrics collection and exposition.
//!
//! # Metrics
//! - `admission_connections_accepted_total` (counter): sockets accepted
//! - `admission_connections_rejected_total` (counter): closed before
//!   hand-off, by `reason`
//! - `admission_protocol_detected_total` (counter): hand-offs by `protocol`
//! - `admission_handshakes_total` (counter): finished handshakes by `outcome`
//!
//! # Design Decisions
//! - Recording is a no-op until `init_metrics` installs the exporter
//! - Label values are static strings to keep cardinality bounded

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_accepted() {
    metrics::counter!("admission_connections_accepted_total").increment(1);
}

/// Record a connection closed before any handler took it.
pub fn record_rejected(reason: &'static str) {
    metrics::counter!("admission_connections_rejected_total", "reason" => reason).increment(1);
}

pub fn record_detected(protocol: &'static str) {
    metrics::counter!("admission_protocol_detected_total", "protocol" => protocol).increment(1);
}

/// Record the end of a handshake: `established`, `failed`, `identity_mismatch`
/// or `timeout`.
pub fn record_handshake(outcome: &'static str) {
    metrics::counter!("admission_handshakes_total", "outcome" => outcome).increment(1);
}
