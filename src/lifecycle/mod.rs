//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config + CLI overrides → Validate → Connect transport
//!     → Master: subscribe, dispatch → ready marker
//!     → Worker: bind listener, accept → ready marker
//!
//! Shutdown (shutdown.rs):
//!     Signal or stop marker → cancel token → sessions publish terminal
//!     chunks → drain tracker → disconnect transport → clear markers
//!
//! Signals (signals.rs), markers (control.rs):
//!     SIGTERM/SIGINT or the stop marker file → trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then transport, then listeners
//! - Shutdown has a drain deadline

pub mod control;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
