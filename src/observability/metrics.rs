//! Metrics collection and exposition.
//!
//! # Metrics
//! - `tunnel_requests_total` (counter): exchanges by role, kind, outcome
//! - `tunnel_watch_sessions_total` (counter): watch relays by termination
//! - `tunnel_correlation_misses_total` (counter): replies nobody waited for
//! - `tunnel_active_sessions` (gauge): in-flight exchanges by role
//! - `tunnel_relayed_chunks_total` (counter): watch chunks published
//! - `tunnel_active_connections` (gauge): open worker connections

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(role: &'static str, kind: &'static str, outcome: &'static str) {
    counter!(
        "tunnel_requests_total",
        "role" => role,
        "kind" => kind,
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_watch_end(termination: &'static str) {
    counter!("tunnel_watch_sessions_total", "termination" => termination).increment(1);
}

pub fn record_chunk_relayed() {
    counter!("tunnel_relayed_chunks_total").increment(1);
}

pub fn record_correlation_miss() {
    counter!("tunnel_correlation_misses_total").increment(1);
}

pub fn session_started(role: &'static str) {
    gauge!("tunnel_active_sessions", "role" => role).increment(1.0);
}

pub fn session_finished(role: &'static str) {
    gauge!("tunnel_active_sessions", "role" => role).decrement(1.0);
}

pub fn record_active_connections(count: usize) {
    gauge!("tunnel_active_connections").set(count as f64);
}

/// Holds `tunnel_active_sessions` up for as long as it lives.
#[derive(Debug)]
pub struct ActiveSession {
    role: &'static str,
}

impl ActiveSession {
    pub fn start(role: &'static str) -> Self {
        session_started(role);
        Self { role }
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        session_finished(self.role);
    }
}
