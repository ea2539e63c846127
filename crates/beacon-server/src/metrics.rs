//! Metrics collection and export for Beacon.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tenvis_beacon_core::{DeliveryStats, DispatchError};
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "beacon_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "beacon_connections_active";
    pub const MESSAGES_TOTAL: &str = "beacon_messages_total";
    pub const MESSAGES_BYTES: &str = "beacon_messages_bytes";
    pub const LATENCY_SECONDS: &str = "beacon_latency_seconds";
    pub const ERRORS_TOTAL: &str = "beacon_errors_total";
    pub const DELIVERIES_TOTAL: &str = "beacon_deliveries_total";
    pub const DISPATCH_ERRORS_TOTAL: &str = "beacon_dispatch_errors_total";
    pub const REGISTRY_REJECTIONS_TOTAL: &str = "beacon_registry_rejections_total";
    pub const PRESENCE_USERS: &str = "beacon_presence_users";
    pub const PRESENCE_CONNECTIONS: &str = "beacon_presence_connections";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames processed");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Gateway deliveries by path (direct, relay, failed)"
    );
    metrics::describe_counter!(
        names::DISPATCH_ERRORS_TOTAL,
        "Commands that failed to dispatch, by kind"
    );
    metrics::describe_counter!(
        names::REGISTRY_REJECTIONS_TOTAL,
        "Connections rejected because they could not be registered"
    );
    metrics::describe_gauge!(names::PRESENCE_USERS, "Users with a connection on this instance");
    metrics::describe_gauge!(
        names::PRESENCE_CONNECTIONS,
        "Connections held by this instance"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record frame processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Short label for a dispatch failure.
#[must_use]
pub fn dispatch_error_kind(error: &DispatchError) -> &'static str {
    match error {
        DispatchError::RouteNotFound(_) => "route_not_found",
        DispatchError::Decode { .. } => "decode",
        DispatchError::HandlerNotRegistered { .. } => "handler_not_registered",
        DispatchError::HandlerFailed { .. } => "handler_failed",
    }
}

/// Record a failed dispatch.
pub fn record_dispatch_error(error: &DispatchError) {
    counter!(names::DISPATCH_ERRORS_TOTAL, "kind" => dispatch_error_kind(error)).increment(1);
}

/// Record a connection rejected by the registry.
pub fn record_registry_rejection() {
    counter!(names::REGISTRY_REJECTIONS_TOTAL).increment(1);
}

/// Publish the gateway's delivery counters.
pub fn record_delivery_stats(stats: DeliveryStats) {
    counter!(names::DELIVERIES_TOTAL, "path" => "direct").absolute(stats.direct);
    counter!(names::DELIVERIES_TOTAL, "path" => "relay").absolute(stats.relayed);
    counter!(names::DELIVERIES_TOTAL, "path" => "failed").absolute(stats.failed);
}

/// Publish local presence sizes.
pub fn set_presence(users: usize, connections: usize) {
    gauge!(names::PRESENCE_USERS).set(users as f64);
    gauge!(names::PRESENCE_CONNECTIONS).set(connections as f64);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
