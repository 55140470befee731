//! Reply correlation for the worker side of the tunnel.

pub mod registry;

pub use registry::{CorrelationEntry, CorrelationRegistry};
