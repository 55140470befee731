//! Pub/sub transport: message envelope, connector seam, in-process broker.

pub mod connector;
pub mod memory;
pub mod message;

pub use connector::{compose_stream_name, ReceptionCallback, TransportConnector, TransportParams};
pub use memory::{MemoryBroker, MemoryConnector};
pub use message::{RequestWatch, TransportMessage};
