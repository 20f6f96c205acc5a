//! Framing: one JSON object per WebSocket text frame.

use crate::protocol::TunnelMessage;

/// Frames larger than this are rejected before parsing.
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024; // 1 MiB

/// Encode a message into a single text frame.
pub fn encode_message(msg: &TunnelMessage) -> Result<String, MessageEncodeError> {
    let text = serde_json::to_string(msg).map_err(MessageEncodeError::Encode)?;
    if text.len() > MAX_MESSAGE_LEN {
        return Err(MessageEncodeError::TooLarge);
    }
    Ok(text)
}

/// Error encoding a message (serde_json or size limit).
#[derive(Debug, thiserror::Error)]
pub enum MessageEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("message too large")]
    TooLarge,
}

/// Decode one text frame.
pub fn decode_message(text: &str) -> Result<TunnelMessage, MessageDecodeError> {
    if text.len() > MAX_MESSAGE_LEN {
        return Err(MessageDecodeError::TooLarge);
    }
    serde_json::from_str(text).map_err(MessageDecodeError::Decode)
}

/// Error decoding a frame (too large, not JSON, or unknown message type).
#[derive(Debug, thiserror::Error)]
pub enum MessageDecodeError {
    #[error("message too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}
