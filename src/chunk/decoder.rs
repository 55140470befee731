//! Incremental chunked-body decoder.
//!
//! The worker feeds every relayed payload through this decoder only to learn
//! when the chunked body is complete. Payload bytes are never rewritten, and
//! data that merely contains `0\r\n\r\n` does not end the body.

use thiserror::Error;

const HEAD_END: &[u8] = b"\r\n\r\n";
const MAX_SIZE_LINE: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("invalid chunk size line: {0:?}")]
    InvalidSize(String),

    #[error("chunk size line exceeds {MAX_SIZE_LINE} bytes")]
    SizeLineTooLong,

    #[error("missing CRLF after chunk data")]
    MissingCrlf,
}

/// Outcome of feeding one block of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeProgress {
    Partial,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Head { matched: usize },
    Size { line: Vec<u8> },
    Data { remaining: usize },
    DataCrlf { seen: usize },
    Trailer { line_len: usize },
    Done,
}

#[derive(Debug, Clone)]
pub struct ChunkDecoder {
    state: State,
    chunks: u64,
}

impl ChunkDecoder {
    /// Decoder that first skips a response head ending in a blank line.
    pub fn with_head() -> Self {
        Self {
            state: State::Head { matched: 0 },
            chunks: 0,
        }
    }

    /// Decoder positioned at the first chunk size line.
    #[cfg(test)]
    pub fn body_only() -> Self {
        Self {
            state: State::Size { line: Vec::new() },
            chunks: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Done
    }

    /// True until the blank line ending the response head has been seen.
    pub fn head_pending(&self) -> bool {
        matches!(self.state, State::Head { .. })
    }

    /// True between chunks, where a terminal chunk may be appended safely.
    pub fn at_chunk_boundary(&self) -> bool {
        matches!(&self.state, State::Size { line } if line.is_empty())
    }

    /// Number of non-empty chunks fully consumed so far.
    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    /// Advance over `bytes`. Bytes after completion are ignored.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<DecodeProgress, ChunkError> {
        let mut i = 0;
        while i < bytes.len() {
            match &mut self.state {
                State::Done => break,
                State::Head { matched } => {
                    let b = bytes[i];
                    i += 1;
                    if b == HEAD_END[*matched] {
                        *matched += 1;
                    } else if b == b'\r' {
                        *matched = 1;
                    } else {
                        *matched = 0;
                    }
                    if *matched == HEAD_END.len() {
                        self.state = State::Size { line: Vec::new() };
                    }
                }
                State::Size { line } => {
                    let b = bytes[i];
                    i += 1;
                    if b != b'\n' {
                        if line.len() >= MAX_SIZE_LINE {
                            return Err(ChunkError::SizeLineTooLong);
                        }
                        line.push(b);
                        continue;
                    }
                    let size = parse_size_line(line)?;
                    self.state = if size == 0 {
                        State::Trailer { line_len: 0 }
                    } else {
                        State::Data { remaining: size }
                    };
                }
                State::Data { remaining } => {
                    let take = (*remaining).min(bytes.len() - i);
                    i += take;
                    *remaining -= take;
                    if *remaining == 0 {
                        self.chunks += 1;
                        self.state = State::DataCrlf { seen: 0 };
                    }
                }
                State::DataCrlf { seen } => {
                    let expected = if *seen == 0 { b'\r' } else { b'\n' };
                    if bytes[i] != expected {
                        return Err(ChunkError::MissingCrlf);
                    }
                    i += 1;
                    *seen += 1;
                    if *seen == 2 {
                        self.state = State::Size { line: Vec::new() };
                    }
                }
                State::Trailer { line_len } => {
                    let b = bytes[i];
                    i += 1;
                    match b {
                        b'\n' if *line_len == 0 => self.state = State::Done,
                        b'\n' => *line_len = 0,
                        b'\r' => {}
                        _ => *line_len += 1,
                    }
                }
            }
        }

        Ok(if self.is_complete() {
            DecodeProgress::Complete
        } else {
            DecodeProgress::Partial
        })
    }
}

fn parse_size_line(line: &[u8]) -> Result<usize, ChunkError> {
    let text = String::from_utf8_lossy(line);
    let digits = text
        .trim_end_matches('\r')
        .split(';')
        .next()
        .unwrap_or("")
        .trim();
    if digits.is_empty() {
        return Err(ChunkError::InvalidSize(text.to_string()));
    }
    usize::from_str_radix(digits, 16).map_err(|_| ChunkError::InvalidSize(text.to_string()))
}
