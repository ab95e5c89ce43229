// Text encoding for `JamMessage`.
//
// The relay carries WebSocket text frames, so there is no length framing:
// one frame is one JSON object. `decode` is the single entry point for
// untrusted relay input. It rejects oversized frames before parsing and
// reports every failure as a `CodecError` so callers can drop the frame
// without inspecting why.

use thiserror::Error;

use crate::message::JamMessage;

/// Largest frame `decode` will parse (1 MB). Timer snapshots are a few
/// hundred bytes; rosters grow linearly with participants.
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message too large: {len} bytes (max {MAX_MESSAGE_LEN})")]
    TooLarge { len: usize },
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Serialize a message into one text frame.
pub fn encode(message: &JamMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(message)?)
}

/// Parse one text frame. Fails on oversized input, invalid JSON, missing
/// fields, and unknown `type` tags.
pub fn decode(text: &str) -> Result<JamMessage, CodecError> {
    if text.len() > MAX_MESSAGE_LEN {
        return Err(CodecError::TooLarge { len: text.len() });
    }
    Ok(serde_json::from_str(text)?)
}
