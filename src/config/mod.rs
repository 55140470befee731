//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → CLI overrides (main.rs)
//!     → validation.rs (semantic checks)
//!     → TunnelConfig (validated, immutable)
//!     → handed by value or Arc to each subsystem at construction
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::ControlConfig;
pub use schema::ListenerConfig;
pub use schema::RelayConfig;
pub use schema::TransportConfig;
pub use schema::TunnelConfig;
pub use schema::UpstreamConfig;
