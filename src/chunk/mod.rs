//! HTTP/1.1 chunked-transfer handling for watch relays.
//!
//! # Data Flow
//! ```text
//! Master side:
//!     upstream body stream
//!     → reassembler.rs (cut into lines or 4096-byte blocks, classify the end)
//!     → framer.rs (hex size + payload + CRLF, terminal 0-chunk)
//!     → one TransportMessage per frame
//!
//! Worker side:
//!     TransportMessage payloads, written to the client untouched
//!     → decoder.rs (tracks chunk boundaries to detect the terminal chunk)
//! ```

pub mod decoder;
pub mod framer;
pub mod reassembler;

pub use decoder::{ChunkDecoder, ChunkError, DecodeProgress};
pub use framer::{frame_body, frame_chunk, TERMINAL_CHUNK};
pub use reassembler::{ChunkReassembler, ReadMode, ReassemblyStep, Termination};
