//! Startup orchestration.
//!
//! # Responsibilities
//! - Apply command-line overrides and validate the result
//! - Start the worker and/or master in dependency order
//! - Wait for a stop signal or the stop marker, then drain and disconnect
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The worker listener starts last, after the transport is connected
//! - Ready markers are written only once a role can serve traffic

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use super::control;
use super::shutdown::Shutdown;
use super::signals;
use crate::config::schema::TlsConfig;
use crate::config::validation::{validate_config, ValidationError};
use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::net::listener::{Listener, ListenerError};
use crate::net::tls::load_tls_acceptor;
use crate::observability::metrics;
use crate::proxy::{
    ApiServerClient, MasterProxy, MasterSettings, Role, Upstream, UpstreamError, WorkerProxy,
    WorkerSettings,
};
use crate::transport::{MemoryBroker, MemoryConnector, TransportConnector, TransportParams};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {}", join_errors(.0))]
    Invalid(Vec<ValidationError>),

    #[error("stop marker {0} is present")]
    StopMarkerPresent(String),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("upstream: {0}")]
    Upstream(#[from] UpstreamError),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// What this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One side of the tunnel.
    Single(Role),
    /// Both sides in one process over the in-process broker.
    Loopback,
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub role: Option<Role>,
    pub server_address: Option<String>,
    pub local_port: Option<u16>,
    pub tls: bool,
}

impl CliOverrides {
    pub fn apply(&self, config: &mut TunnelConfig) {
        if let Some(role) = self.role {
            config.role = role;
        }
        if let Some(address) = &self.server_address {
            config.upstream.server_address = address.clone();
        }
        if let Some(port) = self.local_port {
            config.listener.bind_address = match config.listener.bind_address.parse::<SocketAddr>()
            {
                Ok(mut addr) => {
                    addr.set_port(port);
                    addr.to_string()
                }
                Err(_) => format!("127.0.0.1:{port}"),
            };
        }
        if self.tls && config.listener.tls.is_none() {
            config.listener.tls = Some(TlsConfig {
                cert_path: "server.crt".to_string(),
                key_path: "server.key".to_string(),
            });
        }
    }
}

/// Validate `config` for every role `mode` will run.
pub fn validate_for(config: &TunnelConfig, mode: RunMode) -> Result<(), StartupError> {
    let roles: &[Role] = match mode {
        RunMode::Single(Role::Worker) => &[Role::Worker],
        RunMode::Single(Role::Master) => &[Role::Master],
        RunMode::Loopback => &[Role::Worker, Role::Master],
    };
    let mut errors = Vec::new();
    for role in roles {
        let mut view = config.clone();
        view.role = *role;
        if let Err(found) = validate_config(&view) {
            for e in found {
                if !errors.contains(&e) {
                    errors.push(e);
                }
            }
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(StartupError::Invalid(errors))
    }
}

/// A worker accepting connections.
pub struct RunningWorker {
    pub local_addr: SocketAddr,
    pub worker: Arc<WorkerProxy>,
    pub handle: JoinHandle<Result<(), ListenerError>>,
}

fn refuse_if_stopped(config: &TunnelConfig) -> Result<(), StartupError> {
    if control::stop_requested(&config.control.stop_marker) {
        return Err(StartupError::StopMarkerPresent(
            config.control.stop_marker.display().to_string(),
        ));
    }
    Ok(())
}

/// Bind the listener and start accepting.
pub async fn start_worker(
    config: &TunnelConfig,
    connector: Arc<dyn TransportConnector>,
    shutdown: &Shutdown,
) -> Result<RunningWorker, StartupError> {
    refuse_if_stopped(config)?;

    let tls = match &config.listener.tls {
        Some(tls) => Some(load_tls_acceptor(
            Path::new(&tls.cert_path),
            Path::new(&tls.key_path),
        )?),
        None => None,
    };

    let listener = Listener::bind(&config.listener).await?;
    let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

    let worker = Arc::new(WorkerProxy::new(
        connector,
        WorkerSettings::from_config(config),
    ));
    let handle = shutdown.spawn(Arc::clone(&worker).serve(listener, tls, shutdown.clone()));

    if let Err(e) = control::write_ready_marker(&config.control.worker_ready_marker) {
        tracing::warn!(error = %e, "Could not write worker ready marker");
    }
    tracing::info!(address = %local_addr, tls = config.listener.tls.is_some(), "Worker ready");

    Ok(RunningWorker {
        local_addr,
        worker,
        handle,
    })
}

/// Subscribe the request streams and start dispatching.
pub async fn start_master(
    config: &TunnelConfig,
    connector: Arc<dyn TransportConnector>,
    upstream: Arc<dyn Upstream>,
    shutdown: &Shutdown,
) -> Result<Arc<MasterProxy>, StartupError> {
    refuse_if_stopped(config)?;

    let master = Arc::new(MasterProxy::new(
        connector,
        upstream,
        MasterSettings::from_config(config),
    ));
    let inbox = master.subscribe().await?;
    shutdown.spawn(Arc::clone(&master).run(inbox, shutdown.clone()));

    if let Err(e) = control::write_ready_marker(&config.control.master_ready_marker) {
        tracing::warn!(error = %e, "Could not write master ready marker");
    }
    tracing::info!(server = %config.upstream.server_address, "Master ready");
    Ok(master)
}

/// Run until stopped.
pub async fn run(config: TunnelConfig, mode: RunMode) -> Result<(), StartupError> {
    validate_for(&config, mode)?;

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(shutdown.clone());
    shutdown.spawn(control::watch_stop_marker(
        config.control.stop_marker.clone(),
        Duration::from_millis(config.control.poll_interval_ms),
        shutdown.clone(),
    ));

    let broker = MemoryBroker::new();
    let params = TransportParams::from(&config.transport);
    let mut connectors: Vec<Arc<dyn TransportConnector>> = Vec::new();

    let run_master = matches!(mode, RunMode::Single(Role::Master) | RunMode::Loopback);
    let run_worker = matches!(mode, RunMode::Single(Role::Worker) | RunMode::Loopback);
    if mode != RunMode::Loopback {
        tracing::warn!(
            address = %params.address,
            "Only the in-process transport is built in; no peer process will be reached"
        );
    }

    if run_master {
        let connector: Arc<dyn TransportConnector> =
            Arc::new(MemoryConnector::new(Arc::clone(&broker)));
        connector.connect(&params).await?;
        connectors.push(Arc::clone(&connector));
        let upstream = Arc::new(ApiServerClient::from_config(&config.upstream)?);
        start_master(&config, connector, upstream, &shutdown).await?;
    }

    if run_worker {
        let connector: Arc<dyn TransportConnector> =
            Arc::new(MemoryConnector::new(Arc::clone(&broker)));
        connector.connect(&params).await?;
        connectors.push(Arc::clone(&connector));
        start_worker(&config, connector, &shutdown).await?;
    }

    shutdown.cancelled().await;
    tracing::info!("Draining in-flight sessions");
    let drained = shutdown
        .wait(Duration::from_secs(config.shutdown.drain_timeout_secs))
        .await;

    for connector in connectors {
        if let Err(e) = connector.disconnect().await {
            tracing::warn!(error = %e, "Transport disconnect failed");
        }
    }
    if run_worker {
        control::clear_marker(&config.control.worker_ready_marker);
    }
    if run_master {
        control::clear_marker(&config.control.master_ready_marker);
    }

    tracing::info!(drained, "Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides() {
        let mut config = TunnelConfig::default();
        CliOverrides {
            role: Some(Role::Master),
            server_address: Some("https://10.1.1.1:6443".into()),
            local_port: Some(9443),
            tls: true,
        }
        .apply(&mut config);

        assert_eq!(config.role, Role::Master);
        assert_eq!(config.upstream.server_address, "https://10.1.1.1:6443");
        assert_eq!(config.listener.bind_address, "127.0.0.1:9443");
        assert_eq!(config.listener.tls.unwrap().cert_path, "server.crt");
    }

    #[test]
    fn test_loopback_validates_both_roles() {
        let mut config = TunnelConfig::default();
        config.upstream.server_address = "nope".into();
        assert!(validate_for(&config, RunMode::Single(Role::Worker)).is_ok());

        let err = validate_for(&config, RunMode::Loopback).unwrap_err();
        assert!(err.to_string().contains("upstream.server_address"));
    }

    #[tokio::test]
    async fn test_stop_marker_refuses_start() {
        let marker = std::env::temp_dir().join(format!("kube-tunnel-refuse-{}", std::process::id()));
        std::fs::write(&marker, b"").unwrap();

        let mut config = TunnelConfig::default();
        config.control.stop_marker = marker.clone();
        config.listener.bind_address = "127.0.0.1:0".into();

        let connector = Arc::new(MemoryConnector::new(MemoryBroker::new()));
        let result = start_worker(&config, connector, &Shutdown::new()).await;
        let _ = std::fs::remove_file(&marker);
        assert!(matches!(result, Err(StartupError::StopMarkerPresent(_))));
    }
}
