//! Tunnel error taxonomy.
//!
//! Every failure is scoped to one connection or one session. Nothing here is
//! fatal to the process; callers log and tear down the affected exchange.

use thiserror::Error;

use crate::proxy::upstream::UpstreamError;

/// Errors raised while moving a request through the tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The local client sent bytes that are not an HTTP/1.1 request.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// A `messageTxt` payload was not valid base64.
    #[error("invalid base64 payload: {0}")]
    Decode(#[from] base64::DecodeError),

    /// Publishing, subscribing or (de)serializing on the transport failed.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The call to the real API server failed.
    #[error("upstream failure: {0}")]
    UpstreamFailure(#[from] UpstreamError),

    /// A bounded wait elapsed.
    #[error("timed out after {0} poll cycles")]
    Timeout(u32),

    /// The exchange was cancelled by shutdown.
    #[error("exchange cancelled")]
    Cancelled,

    /// A reply arrived for a stream id nobody is waiting on.
    #[error("no pending exchange for stream {0}")]
    CorrelationMiss(String),

    /// A stream id was registered twice while still outstanding.
    #[error("stream {0} is already registered")]
    DuplicateStream(String),

    /// Socket or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS material could not be loaded.
    #[error("TLS error: {0}")]
    Tls(String),
}

impl TunnelError {
    /// True for socket errors that only mean the peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TunnelError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result alias used across the crate.
pub type TunnelResult<T> = Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::Timeout(300);
        assert_eq!(err.to_string(), "timed out after 300 poll cycles");

        let err = TunnelError::CorrelationMiss("k8s-abc".into());
        assert!(err.to_string().contains("k8s-abc"));
    }

    #[test]
    fn test_disconnect_classification() {
        let reset = TunnelError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(reset.is_disconnect());

        let denied = TunnelError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!denied.is_disconnect());

        assert!(!TunnelError::MalformedRequest("x".into()).is_disconnect());
    }
}
