//! HTTP/1.1 chunk framing.

/// Zero-length chunk that ends a chunked body.
pub const TERMINAL_CHUNK: &[u8] = b"0\r\n\r\n";

/// Frame `payload` as one chunk: lowercase hex length, CRLF, payload, CRLF.
pub fn frame_chunk(payload: &[u8]) -> Vec<u8> {
    let size = format!("{:x}\r\n", payload.len());
    let mut out = Vec::with_capacity(size.len() + payload.len() + 2);
    out.extend_from_slice(size.as_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    out
}

/// Frame a whole body as one chunk followed by the terminal chunk.
///
/// An empty body yields only the terminal chunk.
pub fn frame_body(body: &[u8]) -> Vec<u8> {
    if body.is_empty() {
        return TERMINAL_CHUNK.to_vec();
    }
    let mut out = frame_chunk(body);
    out.extend_from_slice(TERMINAL_CHUNK);
    out
}
