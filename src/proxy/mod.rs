//! Tunnel endpoints.
//!
//! # Data Flow
//! ```text
//! Worker process:
//!     local client ⇄ worker.rs ⇄ transport (request / watchRequest / reply-<id>)
//!
//! Master process:
//!     transport ⇄ master.rs ⇄ upstream.rs ⇄ real API server
//! ```

pub mod master;
pub mod upstream;
pub mod worker;

use serde::{Deserialize, Serialize};

pub use master::{MasterProxy, MasterSettings};
pub use upstream::{ApiServerClient, Upstream, UpstreamError, UpstreamResponse};
pub use worker::{WorkerProxy, WorkerSettings};

/// Which side of the tunnel a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Worker,
    Master,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Worker => "worker",
            Role::Master => "master",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
