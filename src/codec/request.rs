//! API request parsing and serialization.
//!
//! A request is parsed once on the worker (from the client socket) and once on
//! the master (from the decoded `messageTxt`). Both paths share `parse_head`.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::{find_header, Headers};
use crate::error::{TunnelError, TunnelResult};

/// Query fragment that marks a watch request when it is not the first parameter.
pub const WATCH_PARAM: &str = "&watch=true";

/// Upper bound on request line plus headers.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;

/// Upper bound on a declared request body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Size bounds applied while parsing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// One HTTP/1.1 request as seen by the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: String,
    pub path: String,
    pub protocol: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl ApiRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            protocol: "HTTP/1.1".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach a body and keep `Content-Length` in step with it.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self.headers
            .retain(|(k, _)| !k.eq_ignore_ascii_case("content-length"));
        self.headers
            .push(("Content-Length".to_string(), self.body.len().to_string()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Declared body length, if any.
    pub fn content_length(&self) -> TunnelResult<Option<usize>> {
        match self.header("content-length") {
            None => Ok(None),
            Some(v) => v.trim().parse::<usize>().map(Some).map_err(|_| {
                TunnelError::MalformedRequest(format!("invalid Content-Length: {v}"))
            }),
        }
    }

    /// Path with the query string removed.
    pub fn path_no_parameter(&self) -> &str {
        match self.path.find('?') {
            Some(idx) => &self.path[..idx],
            None => &self.path,
        }
    }

    /// Query string without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        self.path.find('?').map(|idx| &self.path[idx + 1..])
    }

    pub fn is_watch(&self) -> bool {
        is_watch_request(self)
    }

    pub fn request_line(&self) -> String {
        format!("{} {} {}", self.method, self.path, self.protocol)
    }
}

/// A request is a watch when `watch=true` appears as a query parameter.
///
/// Matches `&watch=true` anywhere in the target, or `?watch=true` as the first
/// parameter.
pub fn is_watch_request(request: &ApiRequest) -> bool {
    if request.path.contains(WATCH_PARAM) {
        return true;
    }
    match request.query() {
        Some(q) => q == "watch=true" || q.starts_with("watch=true&"),
        None => false,
    }
}

/// Serialize a request back to wire bytes.
pub fn encode(request: &ApiRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + request.body.len());
    out.extend_from_slice(request.request_line().as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in &request.headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&request.body);
    out
}

/// Parse a complete request from a byte buffer with the default limits.
pub fn decode(raw: &[u8]) -> TunnelResult<ApiRequest> {
    decode_with(raw, &RequestLimits::default())
}

/// Parse a complete request from a byte buffer.
pub fn decode_with(raw: &[u8], limits: &RequestLimits) -> TunnelResult<ApiRequest> {
    let head_end = find_subsequence(raw, b"\r\n\r\n")
        .ok_or_else(|| TunnelError::MalformedRequest("headers not terminated".into()))?;
    let head = std::str::from_utf8(&raw[..head_end])
        .map_err(|_| TunnelError::MalformedRequest("headers are not UTF-8".into()))?;
    if head_end > limits.max_header_bytes {
        return Err(TunnelError::MalformedRequest(format!(
            "headers exceed {} bytes",
            limits.max_header_bytes
        )));
    }
    let mut request = parse_head(head)?;

    if let Some(len) = body_length(&request, limits)? {
        let start = head_end + 4;
        let end = start.checked_add(len).ok_or_else(|| {
            TunnelError::MalformedRequest(format!("Content-Length out of range: {len}"))
        })?;
        let body = raw.get(start..end).ok_or_else(|| {
            TunnelError::MalformedRequest(format!(
                "body truncated: expected {len} bytes, got {}",
                raw.len().saturating_sub(start)
            ))
        })?;
        request.body = body.to_vec();
    }
    Ok(request)
}

/// Read one request from a client connection.
///
/// Returns `Ok(None)` when the peer closes before sending anything, which is
/// the normal end of a keep-alive connection.
pub async fn read_request<R>(
    reader: &mut R,
    limits: &RequestLimits,
) -> TunnelResult<Option<ApiRequest>>
where
    R: AsyncBufRead + Unpin,
{
    let max_header_bytes = limits.max_header_bytes;
    let mut head = Vec::with_capacity(1024);
    loop {
        let line_start = head.len();
        let budget = (max_header_bytes + 1).saturating_sub(head.len()) as u64;
        let n = (&mut *reader)
            .take(budget)
            .read_until(b'\n', &mut head)
            .await?;

        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(TunnelError::MalformedRequest(
                "connection closed before end of headers".into(),
            ));
        }
        if head.len() > max_header_bytes {
            return Err(TunnelError::MalformedRequest(format!(
                "headers exceed {max_header_bytes} bytes"
            )));
        }

        let line = &head[line_start..];
        if line == b"\r\n" || line == b"\n" {
            if line_start == 0 {
                // Stray CRLF between pipelined requests.
                head.clear();
                continue;
            }
            break;
        }
    }

    let text = std::str::from_utf8(&head)
        .map_err(|_| TunnelError::MalformedRequest("headers are not UTF-8".into()))?;
    let mut request = parse_head(text)?;

    if let Some(len) = body_length(&request, limits)? {
        // Grows with the bytes that actually arrive.
        let mut body = Vec::with_capacity(len.min(8 * 1024));
        (&mut *reader)
            .take(len as u64)
            .read_to_end(&mut body)
            .await?;
        if body.len() < len {
            return Err(TunnelError::MalformedRequest(format!(
                "body truncated: expected {len} bytes, got {}",
                body.len()
            )));
        }
        request.body = body;
    }
    Ok(Some(request))
}

/// Declared body length, rejected when above `limits.max_body_bytes`.
fn body_length(request: &ApiRequest, limits: &RequestLimits) -> TunnelResult<Option<usize>> {
    match request.content_length()? {
        Some(len) if len > limits.max_body_bytes => Err(TunnelError::MalformedRequest(format!(
            "body of {len} bytes exceeds {} bytes",
            limits.max_body_bytes
        ))),
        other => Ok(other),
    }
}

fn parse_head(head: &str) -> TunnelResult<ApiRequest> {
    let mut lines = head.lines().filter(|l| !l.is_empty());
    let request_line = lines
        .next()
        .ok_or_else(|| TunnelError::MalformedRequest("empty request".into()))?;

    let mut parts = request_line.split(' ').filter(|p| !p.is_empty());
    let (method, path, protocol) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v), None) => (m, p, v),
        _ => {
            return Err(TunnelError::MalformedRequest(format!(
                "bad request line: {request_line}"
            )))
        }
    };
    if !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(TunnelError::MalformedRequest(format!("bad method: {method}")));
    }
    if !protocol.starts_with("HTTP/") {
        return Err(TunnelError::MalformedRequest(format!(
            "bad protocol: {protocol}"
        )));
    }

    let headers = lines.map(parse_header_line).collect::<TunnelResult<Headers>>()?;

    Ok(ApiRequest {
        method: method.to_string(),
        path: path.to_string(),
        protocol: protocol.to_string(),
        headers,
        body: Vec::new(),
    })
}

fn parse_header_line(line: &str) -> TunnelResult<(String, String)> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| TunnelError::MalformedRequest(format!("bad header line: {line}")))?;
    if name.is_empty() || name.bytes().any(|b| b.is_ascii_whitespace()) {
        return Err(TunnelError::MalformedRequest(format!("bad header name: {name}")));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
