//! Metrics collection and exposition.
//!
//! # Metrics
//! - `bridge_commands_total` (counter): setup/teardown commands by status
//! - `bridge_data_commands_total` (counter): data commands by method, status
//! - `bridge_data_command_duration_seconds` (histogram): HTTP cycle latency
//! - `bridge_active_connections` (gauge): live connection count
//! - `bridge_pending_setups` (gauge): Setups waiting for a worker slot
//! - `bridge_publish_failures_total` (counter): replies that could not be published

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::protocol::BridgeStatus;

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_command(command: &'static str, status: BridgeStatus) {
    counter!("bridge_commands_total", "command" => command, "status" => status.as_str()).increment(1);
}

pub fn record_data_command(method: &str, status: BridgeStatus, start: Instant) {
    count_data_command(method, status);
    histogram!("bridge_data_command_duration_seconds").record(start.elapsed().as_secs_f64());
}

/// A data command refused before any HTTP cycle ran. Counted, not timed.
pub fn record_rejected_data_command(status: BridgeStatus) {
    count_data_command("none", status);
}

fn count_data_command(method: &str, status: BridgeStatus) {
    counter!(
        "bridge_data_commands_total",
        "method" => method.to_string(),
        "status" => status.as_str()
    )
    .increment(1);
}

pub fn record_active_connections(count: usize) {
    gauge!("bridge_active_connections").set(count as f64);
}

pub fn record_pending_setups(count: usize) {
    gauge!("bridge_pending_setups").set(count as f64);
}

pub fn record_publish_failure(channel: &'static str) {
    counter!("bridge_publish_failures_total", "channel" => channel).increment(1);
}
