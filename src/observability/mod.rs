//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Worker connections, master sessions, correlation registry:
//!     → logging.rs (structured log events with stream_id / connection_id)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by RUST_LOG or the configured level)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Every log line for one exchange carries its `stream_id`
//! - Metric updates are cheap and never fail; with no recorder installed
//!   they are no-ops

pub mod logging;
pub mod metrics;
