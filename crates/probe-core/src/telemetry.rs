//! Measurement names, histogram layout and exporter setup.
//!
//! Everything in the crate records through the `metrics` facade. Without an
//! installed recorder the calls are no-ops, which is what the unit tests rely
//! on.

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;

pub const HTTP_CONNECTION: &str = "http.client.connection";
pub const CONNECT_DURATION: &str = "http.client.connect.duration";
pub const DNS_DURATION: &str = "http.client.dns.duration";
pub const IDLE_DURATION: &str = "http.client.idle_connection.duration";
pub const REQUEST_DURATION: &str = "http.client.request.duration";
pub const TTFB_DURATION: &str = "http.client.ttfb.duration";
pub const TLS_HANDSHAKE_DURATION: &str = "http.client.tls_handshake.duration";

pub const OPEN_CONNECTIONS: &str = "http.client.open_connections";
pub const CONNECTIONS_OPENED: &str = "http.client.connections.opened";
pub const CONNECTIONS_CLOSED: &str = "http.client.connections.closed";
pub const NETSTAT_CONNECTIONS: &str = "http.client.netstat_connections";
pub const NETSTAT_DURATION: &str = "netstat.duration";

pub const TASK_COUNT: &str = "probe.task.count";
pub const GOVERNOR_HELD: &str = "probe.governor.held";
pub const ITERATIONS: &str = "probe.iterations";

pub const ATTR_REUSED: &str = "reused";
pub const ATTR_WAS_IDLE: &str = "was_idle";
pub const ATTR_STATUS_CODE: &str = "http.response.status_code";
pub const ATTR_ERROR_TYPE: &str = "error.type";
pub const ATTR_PROTOCOL_VERSION: &str = "network.protocol.version";
pub const ATTR_STATE: &str = "state";

/// Bucket boundaries in seconds shared by every duration histogram.
pub const DURATION_BUCKETS: &[f64] = &[
    0.0001, 0.00025, 0.0005, 0.00075, 0.001, 0.0025, 0.005, 0.0075, 0.01, 0.025, 0.05, 0.075,
    0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

/// Register units and descriptions with whatever recorder is installed.
pub fn describe() {
    describe_counter!(HTTP_CONNECTION, "Connections handed to requests");
    describe_histogram!(CONNECT_DURATION, Unit::Seconds, "Duration to perform HTTP connection");
    describe_histogram!(DNS_DURATION, Unit::Seconds, "Duration to resolve DNS name");
    describe_histogram!(IDLE_DURATION, Unit::Seconds, "Duration that the connection was idle");
    describe_histogram!(REQUEST_DURATION, Unit::Seconds, "Duration of the full request");
    describe_histogram!(TTFB_DURATION, Unit::Seconds, "Time to first byte");
    describe_histogram!(
        TLS_HANDSHAKE_DURATION,
        Unit::Seconds,
        "Duration to negotiate the TLS handshake"
    );
    describe_histogram!(NETSTAT_DURATION, Unit::Seconds, "Duration to perform netstat operation");

    describe_gauge!(OPEN_CONNECTIONS, "Transport connections currently open");
    describe_gauge!(CONNECTIONS_OPENED, "Transport connections opened since start");
    describe_gauge!(CONNECTIONS_CLOSED, "Transport connections closed since start");
    describe_gauge!(NETSTAT_CONNECTIONS, "Connections of this process by socket state");
    describe_gauge!(TASK_COUNT, "Request tasks currently alive");
    describe_gauge!(GOVERNOR_HELD, "Governor slots held in the active stage");
    describe_counter!(ITERATIONS, "Requests admitted by the load driver");
}

/// Install a Prometheus recorder serving `/metrics` on `addr`.
///
/// Must be called from within a tokio runtime.
pub fn install_prometheus(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(Matcher::Suffix("duration".to_string()), DURATION_BUCKETS)
        .context("invalid histogram buckets")?
        .install()
        .with_context(|| format!("Failed to install metrics exporter on {addr}"))?;
    describe();
    Ok(())
}
