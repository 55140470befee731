//! HTTP/1.1 request/response codec.
//!
//! # Data Flow
//! ```text
//! Worker side:
//!     client socket bytes
//!     → request.rs (read_request: request line, headers, Content-Length body)
//!     → request.rs (encode) → encoding.rs (base64) → TransportMessage.messageTxt
//!
//! Master side:
//!     TransportMessage.messageTxt
//!     → encoding.rs (base64 decode) → request.rs (decode) → upstream call
//!     → response.rs (status line + headers for the reply)
//! ```
//!
//! # Design Decisions
//! - Headers keep their original order and spelling; lookups are case-insensitive
//! - Only `Content-Length` delimited request bodies are supported
//! - The codec never touches the network beyond the reader it is handed

pub mod encoding;
pub mod request;
pub mod response;

pub use encoding::{from_base64, to_base64};
pub use request::{
    decode, decode_with, encode, is_watch_request, read_request, ApiRequest, RequestLimits,
};
pub use response::ResponseHead;

/// Ordered header list as it appeared on the wire.
pub type Headers = Vec<(String, String)>;

/// Case-insensitive lookup of the first header named `name`.
pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_header_case_insensitive() {
        let headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("accept".to_string(), "*/*".to_string()),
        ];
        assert_eq!(find_header(&headers, "content-type"), Some("application/json"));
        assert_eq!(find_header(&headers, "ACCEPT"), Some("*/*"));
        assert_eq!(find_header(&headers, "host"), None);
    }
}
