//! Transport message envelope.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{encode, from_base64, to_base64, ApiRequest};
use crate::error::{TunnelError, TunnelResult};

/// Prefix of every generated stream id.
pub const STREAM_ID_PREFIX: &str = "k8s-";

/// Prefix of the per-request reply stream.
pub const REPLY_STREAM_PREFIX: &str = "reply-";

/// Whether the message belongs to a watch exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RequestWatch {
    Yes,
    No,
    /// Internal bootstrap messages that carry no request.
    #[default]
    Empty,
}

impl From<bool> for RequestWatch {
    fn from(watch: bool) -> Self {
        if watch {
            RequestWatch::Yes
        } else {
            RequestWatch::No
        }
    }
}

/// One message on the pub/sub transport.
///
/// Serialized as `{"streamId": ..., "messageTxt": ..., "requestWatch": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportMessage {
    pub stream_id: String,
    /// Base64 of a serialized request or of a raw response payload.
    pub message_txt: String,
    pub request_watch: RequestWatch,
}

impl TransportMessage {
    /// Wrap a client request under a fresh stream id.
    pub fn for_request(request: &ApiRequest) -> Self {
        Self {
            stream_id: new_stream_id(),
            message_txt: to_base64(&encode(request)),
            request_watch: request.is_watch().into(),
        }
    }

    /// Wrap a response payload for the reply stream of `stream_id`.
    pub fn reply(stream_id: &str, payload: &[u8], watch: RequestWatch) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            message_txt: to_base64(payload),
            request_watch: watch,
        }
    }

    pub fn is_watch(&self) -> bool {
        self.request_watch == RequestWatch::Yes
    }

    /// Decoded `messageTxt`.
    pub fn payload(&self) -> TunnelResult<Vec<u8>> {
        from_base64(&self.message_txt)
    }

    /// Local name of the stream replies for this message travel on.
    pub fn reply_stream_local(&self) -> String {
        reply_stream_local(&self.stream_id)
    }

    pub fn to_json(&self) -> TunnelResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TunnelError::TransportFailure(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> TunnelResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| TunnelError::TransportFailure(e.to_string()))
    }
}

pub fn new_stream_id() -> String {
    format!("{STREAM_ID_PREFIX}{}", Uuid::new_v4().simple())
}

pub fn reply_stream_local(stream_id: &str) -> String {
    format!("{REPLY_STREAM_PREFIX}{stream_id}")
}
