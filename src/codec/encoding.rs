//! Transport-safe payload encoding.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::TunnelResult;

/// Encode raw bytes for a `messageTxt` field.
pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a `messageTxt` field back into raw bytes.
pub fn from_base64(text: &str) -> TunnelResult<Vec<u8>> {
    Ok(STANDARD.decode(text)?)
}
