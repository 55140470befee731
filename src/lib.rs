//! Kubernetes API tunnel over a publish/subscribe transport.
//!
//! A worker process exposes a local endpoint that looks like an API server;
//! a master process forwards each request to the real API server and streams
//! the response back, watch bodies included.

pub mod chunk;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod transport;

pub use config::schema::TunnelConfig;
pub use error::{TunnelError, TunnelResult};
pub use lifecycle::Shutdown;
pub use proxy::{MasterProxy, Role, WorkerProxy};
