//! Master-side watch body reassembly.
//!
//! # Responsibilities
//! - Cut the upstream body into units (JSON lines, or 4096-byte blocks for
//!   protobuf watches)
//! - Frame each unit as one HTTP chunk, the first one prefixed with the head
//! - Classify how the stream ended so the caller can log and count it
//!
//! Termination is decided in this order: a 410 Gone status or event, a read
//! timeout, end of body, any other read failure, cancellation of the session.

use std::time::Duration;

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use super::framer::{frame_chunk, TERMINAL_CHUNK};
use crate::codec::ResponseHead;
use crate::proxy::upstream::{BodyStream, UpstreamError};

/// Block size for binary watch streams.
pub const PROTOBUF_READ_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Up to and including the next `\n`.
    Lines,
    /// Whatever is available, at most this many bytes.
    Fixed(usize),
}

impl ReadMode {
    pub fn for_head(head: &ResponseHead) -> Self {
        if head.is_protobuf() {
            ReadMode::Fixed(PROTOBUF_READ_SIZE)
        } else {
            ReadMode::Lines
        }
    }
}

/// Why a watch relay stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The resource version expired (HTTP 410 or an ERROR event with code 410).
    Gone,
    /// No bytes arrived within the read timeout.
    Timeout,
    /// The upstream closed the body.
    Exhausted,
    /// Reading the body failed.
    Failed(String),
    /// The session was cancelled locally.
    Cancelled,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Gone => "gone",
            Termination::Timeout => "timeout",
            Termination::Exhausted => "eof",
            Termination::Failed(_) => "failed",
            Termination::Cancelled => "cancelled",
        }
    }

    /// Gone, timeout and EOF are the normal ways a watch ends.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Termination::Gone | Termination::Timeout | Termination::Exhausted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyStep {
    /// A framed chunk ready to publish.
    Chunk(Vec<u8>),
    End(Termination),
}

pub struct ChunkReassembler {
    head: Option<Vec<u8>>,
    body: BodyStream,
    mode: ReadMode,
    read_timeout: Duration,
    buffer: BytesMut,
    eof: bool,
    gone_status: bool,
    pending_end: Option<Termination>,
    finished: Option<Termination>,
    frames: u64,
}

impl ChunkReassembler {
    pub fn new(head: &ResponseHead, body: BodyStream, read_timeout: Duration) -> Self {
        Self {
            head: Some(head.to_bytes()),
            body,
            mode: ReadMode::for_head(head),
            read_timeout,
            buffer: BytesMut::with_capacity(PROTOBUF_READ_SIZE),
            eof: false,
            gone_status: head.status == 410,
            pending_end: None,
            finished: None,
            frames: 0,
        }
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    /// Frames emitted so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Produce the next framed chunk or the reason the stream ended.
    ///
    /// Once `End` has been returned every later call returns it again.
    pub async fn next_step(&mut self, cancel: &CancellationToken) -> ReassemblyStep {
        if let Some(done) = &self.finished {
            return ReassemblyStep::End(done.clone());
        }
        if let Some(end) = self.pending_end.take() {
            return self.end(end);
        }

        loop {
            if let Some(unit) = self.take_unit() {
                if self.mode == ReadMode::Lines && is_gone_event(&unit) {
                    self.pending_end = Some(Termination::Gone);
                }
                return ReassemblyStep::Chunk(self.frame(&unit));
            }

            if self.eof {
                return self.finish(self.normal_end(Termination::Exhausted));
            }

            let read = tokio::select! {
                _ = cancel.cancelled() => None,
                read = tokio::time::timeout(self.read_timeout, self.body.next()) => Some(read),
            };

            match read {
                None => return self.finish(Termination::Cancelled),
                Some(Err(_elapsed)) => return self.finish(self.normal_end(Termination::Timeout)),
                Some(Ok(None)) => self.eof = true,
                Some(Ok(Some(Ok(bytes)))) => self.buffer.extend_from_slice(&bytes),
                Some(Ok(Some(Err(UpstreamError::Timeout)))) => {
                    return self.finish(self.normal_end(Termination::Timeout))
                }
                Some(Ok(Some(Err(UpstreamError::Gone)))) => {
                    return self.finish(Termination::Gone)
                }
                Some(Ok(Some(Err(e)))) => return self.finish(Termination::Failed(e.to_string())),
            }
        }
    }

    /// Final payload: the terminal chunk, preceded by the head if no frame
    /// carried it yet.
    pub fn terminal_payload(&mut self) -> Vec<u8> {
        let mut out = self.head.take().unwrap_or_default();
        out.extend_from_slice(TERMINAL_CHUNK);
        out
    }

    fn take_unit(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }
        match self.mode {
            ReadMode::Lines => {
                let pos = self.buffer.iter().position(|&b| b == b'\n')?;
                Some(self.buffer.split_to(pos + 1).to_vec())
            }
            ReadMode::Fixed(max) => {
                let take = max.min(self.buffer.len());
                Some(self.buffer.split_to(take).to_vec())
            }
        }
    }

    fn frame(&mut self, unit: &[u8]) -> Vec<u8> {
        self.frames += 1;
        let framed = frame_chunk(unit);
        match self.head.take() {
            Some(mut head) => {
                head.extend_from_slice(&framed);
                head
            }
            None => framed,
        }
    }

    fn normal_end(&self, termination: Termination) -> Termination {
        if self.gone_status {
            Termination::Gone
        } else {
            termination
        }
    }

    /// Flush bytes still buffered as one last frame, then end.
    fn finish(&mut self, termination: Termination) -> ReassemblyStep {
        if !self.buffer.is_empty() {
            let rest = self.buffer.split().to_vec();
            if self.mode == ReadMode::Lines && is_gone_event(&rest) {
                self.pending_end = Some(Termination::Gone);
            } else {
                self.pending_end = Some(termination);
            }
            return ReassemblyStep::Chunk(self.frame(&rest));
        }
        self.end(termination)
    }

    fn end(&mut self, termination: Termination) -> ReassemblyStep {
        self.finished = Some(termination.clone());
        ReassemblyStep::End(termination)
    }
}

/// True for a watch event `{"type":"ERROR","object":{"code":410,...}}`.
pub fn is_gone_event(line: &[u8]) -> bool {
    if !line.windows(5).any(|w| w == b"ERROR") {
        return false;
    }
    match serde_json::from_slice::<serde_json::Value>(line) {
        Ok(event) => {
            event.get("type").and_then(|t| t.as_str()) == Some("ERROR")
                && event
                    .get("object")
                    .and_then(|o| o.get("code"))
                    .and_then(|c| c.as_u64())
                    == Some(410)
        }
        Err(_) => false,
    }
}
