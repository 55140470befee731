//! Response head rendering for replies written back to the client.

use super::{find_header, Headers};

pub const PROTOBUF_CONTENT_TYPE: &str = "application/vnd.kubernetes.protobuf";

/// Status line plus headers of an upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub protocol: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            protocol: "HTTP/1.1".to_string(),
            status,
            reason: reason.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Replace every header named `name` with a single value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.remove_header(name);
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Watch streams in protobuf are read in fixed-size blocks instead of lines.
    pub fn is_protobuf(&self) -> bool {
        self.header("content-type")
            .map(|v| v.starts_with(PROTOBUF_CONTENT_TYPE))
            .unwrap_or(false)
    }

    /// `{protocol} {status} {reason}\r\n` followed by headers and a blank line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.protocol, self.status, self.reason);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}
