//! Plain-protocol notification frames.
//!
//! Layout: `$`, a big-endian `u32` length, then that many payload bytes.
//! The payload is the JSON notification followed by a NUL, and the length
//! counts the NUL.

use serde_json::Value;
use thiserror::Error;

use crate::jsonrpc::strip_terminator;

pub const NOTIFY_MARKER: u8 = b'$';

/// Marker plus length prefix.
pub const NOTIFY_HEADER_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum NotifyFrameError {
    #[error("notify frame starts with {0:#04x}, expected '$'")]
    BadMarker(u8),

    #[error("notification of {0} bytes does not fit a u32 length prefix")]
    TooLarge(usize),

    #[error("notification payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frame a serialized notification (without terminator) for the plain
/// protocol.
pub fn encode_notify_frame(json: &[u8]) -> Result<Vec<u8>, NotifyFrameError> {
    let payload_len = json.len() + 1;
    let len = u32::try_from(payload_len).map_err(|_| NotifyFrameError::TooLarge(payload_len))?;

    let mut frame = Vec::with_capacity(NOTIFY_HEADER_LEN + payload_len);
    frame.push(NOTIFY_MARKER);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(json);
    frame.push(0);
    Ok(frame)
}

/// Decode the first frame in `buf`.
///
/// Returns the notification and the number of bytes it occupied, or `None`
/// while the frame is still incomplete.
pub fn decode_notify_frame(buf: &[u8]) -> Result<Option<(Value, usize)>, NotifyFrameError> {
    let Some(&marker) = buf.first() else {
        return Ok(None);
    };
    if marker != NOTIFY_MARKER {
        return Err(NotifyFrameError::BadMarker(marker));
    }
    let Some(len_bytes) = buf.get(1..NOTIFY_HEADER_LEN) else {
        return Ok(None);
    };
    let mut len = [0u8; 4];
    len.copy_from_slice(len_bytes);
    let total = NOTIFY_HEADER_LEN + u32::from_be_bytes(len) as usize;

    let Some(payload) = buf.get(NOTIFY_HEADER_LEN..total) else {
        return Ok(None);
    };
    let value = serde_json::from_slice(strip_terminator(payload))?;
    Ok(Some((value, total)))
}
