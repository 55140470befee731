//! Network layer for the worker's local API endpoint.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → tls.rs (optional TLS handshake)
//!     → connection.rs (id + open-connection count)
//!     → proxy::worker (request/reply state machine)
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - TLS material is loaded once and shared by every connection

pub mod connection;
pub mod listener;
pub mod tls;
