//! kube-tunnel
//!
//! Carries Kubernetes API traffic between a worker and a master over a
//! publish/subscribe transport.
//!
//! ```text
//!   kubectl ──▶ worker ──▶ "request" / "watchRequest" ──▶ master ──▶ API server
//!   kubectl ◀── worker ◀──       "reply-<id>"          ◀── master ◀──
//! ```

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use kube_tunnel::config::loader::load_config;
use kube_tunnel::lifecycle::startup::{self, CliOverrides, RunMode};
use kube_tunnel::observability::logging::init_logging;
use kube_tunnel::{Role, TunnelConfig};

#[derive(Parser)]
#[command(name = "kube-tunnel")]
#[command(about = "Kubernetes API tunnel over a pub/sub transport", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Which side of the tunnel to run
    #[arg(short, long, value_enum)]
    role: Option<RoleArg>,

    /// API server base URL (master)
    #[arg(long)]
    server_address: Option<String>,

    /// Local listening port (worker)
    #[arg(long)]
    local_port: Option<u16>,

    /// Serve TLS on the local listener
    #[arg(long)]
    tls: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Worker,
    Master,
    /// Worker and master in one process
    Loopback,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => TunnelConfig::default(),
    };

    let (role, mode) = match cli.role {
        Some(RoleArg::Worker) => (Some(Role::Worker), RunMode::Single(Role::Worker)),
        Some(RoleArg::Master) => (Some(Role::Master), RunMode::Single(Role::Master)),
        Some(RoleArg::Loopback) => (None, RunMode::Loopback),
        None => (None, RunMode::Single(config.role)),
    };

    CliOverrides {
        role,
        server_address: cli.server_address,
        local_port: cli.local_port,
        tls: cli.tls,
    }
    .apply(&mut config);

    init_logging(&config.observability.log_level);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?mode,
        bind_address = %config.listener.bind_address,
        server_address = %config.upstream.server_address,
        "kube-tunnel starting"
    );

    startup::run(config, mode).await?;
    Ok(())
}
