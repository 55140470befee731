//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the tunnel.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::RequestLimits;
use crate::proxy::Role;

/// Root configuration for one tunnel process.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TunnelConfig {
    /// Which side of the tunnel this process runs.
    pub role: Role,

    /// Local listener exposed to API clients (worker only).
    pub listener: ListenerConfig,

    /// Real API server reached by the master.
    pub upstream: UpstreamConfig,

    /// Pub/sub transport parameters.
    pub transport: TransportConfig,

    /// Reply polling and liveness guards.
    pub relay: RelayConfig,

    /// Marker files used to coordinate start and stop.
    pub control: ControlConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:8091").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Upper bound on request line plus headers.
    pub max_header_bytes: usize,

    /// Upper bound on a request body, enforced by worker and master.
    pub max_body_bytes: usize,
}

impl ListenerConfig {
    pub fn request_limits(&self) -> RequestLimits {
        RequestLimits {
            max_header_bytes: self.max_header_bytes,
            max_body_bytes: self.max_body_bytes,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8091".to_string(),
            tls: None,
            max_connections: 1_024,
            max_header_bytes: 64 * 1024,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Upstream API server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the API server, e.g. "https://10.0.0.1:6443".
    pub server_address: String,

    /// CA bundle used to verify the API server (PEM).
    pub ca_cert_path: Option<PathBuf>,

    /// Client certificate (PEM). Requires `client_key_path`.
    pub client_cert_path: Option<PathBuf>,

    /// Client private key (PEM).
    pub client_key_path: Option<PathBuf>,

    /// Bearer token sent instead of any client `Authorization` header.
    pub bearer_token: Option<String>,

    /// Disable certificate verification. Test clusters only.
    pub insecure_skip_verify: bool,

    pub connect_timeout_ms: u64,

    /// Whole-exchange timeout for non-watch calls.
    pub request_timeout_ms: u64,

    /// Per-read timeout while relaying a watch body.
    pub watch_read_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            server_address: "https://127.0.0.1:6443".to_string(),
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            bearer_token: None,
            insecure_skip_verify: false,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            watch_read_timeout_ms: 10_000,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn watch_read_timeout(&self) -> Duration {
        Duration::from_millis(self.watch_read_timeout_ms)
    }
}

/// Pub/sub transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Broker address handed to the connector.
    pub address: String,

    /// Application identifier used when connecting.
    pub application_id: String,

    /// Namespace prefix for stream names. Empty means none.
    pub namespace: String,

    /// Stream carrying plain requests.
    pub request_stream: String,

    /// Stream carrying watch requests.
    pub watch_request_stream: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            address: "memory://local".to_string(),
            application_id: "kube-tunnel".to_string(),
            namespace: String::new(),
            request_stream: "request".to_string(),
            watch_request_stream: "watchRequest".to_string(),
        }
    }
}

/// Reply polling configuration on the worker.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Length of one poll cycle.
    pub poll_interval_ms: u64,

    /// Empty cycles tolerated before the first reply.
    pub first_reply_max_polls: u32,

    /// Empty cycles tolerated between watch payloads.
    pub watch_idle_max_polls: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            first_reply_max_polls: 300,
            watch_idle_max_polls: 600,
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Marker file configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Presence of this file stops the process.
    pub stop_marker: PathBuf,

    /// Created by the worker once listening.
    pub worker_ready_marker: PathBuf,

    /// Created by the master once subscribed.
    pub master_ready_marker: PathBuf,

    pub poll_interval_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            stop_marker: PathBuf::from("/tmp/EndClientRun.k8s"),
            worker_ready_marker: PathBuf::from("ClientReady.k8s"),
            master_ready_marker: PathBuf::from("ServerReady.k8s"),
            poll_interval_ms: 1_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Exporter bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long in-flight sessions get to publish their terminal message.
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 10,
        }
    }
}
