//! Length-prefixed JSON framing used by browser native messaging.
//!
//! Every frame is a `u32` byte count in native byte order followed by exactly
//! that many bytes of UTF-8 JSON. Nothing is delimiter-scanned: the decoder
//! reads the prefix, then the declared payload, so a frame whose payload is
//! not valid JSON leaves the stream positioned at the next frame.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, ErrorKind, Read, Write};
use thiserror::Error;

/// Largest payload the host will accept (10 MiB).
pub const MAX_FRAME_LEN: u32 = 10 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: invalid message length 0")]
    EmptyFrame,
    #[error("frame too large: {0} bytes")]
    TooLarge(u32),
    #[error("failed to read message length: {0}")]
    ReadLength(#[source] io::Error),
    #[error("failed to read message body: {0}")]
    ReadBody(#[source] io::Error),
    #[error("malformed JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),
    #[error("invalid message: {0}")]
    InvalidMessage(#[source] serde_json::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("outgoing frame too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("failed to write frame: {0}")]
    Write(#[source] io::Error),
}

/// Read one raw payload. `Ok(None)` means the stream closed before a complete
/// length prefix arrived, which is how a browser disconnect looks.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError> {
    let mut prefix = [0u8; PREFIX_LEN];
    let mut filled = 0;
    while filled < PREFIX_LEN {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) => return Ok(None),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(FrameError::ReadLength(e)),
        }
    }

    let len = u32::from_ne_bytes(prefix);
    if len == 0 {
        return Err(FrameError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .map_err(FrameError::ReadBody)?;
    Ok(Some(payload))
}

/// Decode a payload into `T`, distinguishing bytes that are not JSON at all
/// from JSON that does not fit the schema.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FrameError> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(FrameError::MalformedJson)?;
    serde_json::from_value(value).map_err(FrameError::InvalidMessage)
}

pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, FrameError> {
    match read_frame(reader)? {
        Some(payload) => decode_payload(&payload).map(Some),
        None => Ok(None),
    }
}

/// Prefix and payload in one buffer, ready for a single `write_all`.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(value).map_err(FrameError::Encode)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or(FrameError::PayloadTooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
    frame.extend_from_slice(&len.to_ne_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), FrameError> {
    let frame = encode_frame(value)?;
    writer.write_all(&frame).map_err(FrameError::Write)?;
    writer.flush().map_err(FrameError::Write)
}
