//! Length-prefixed binary framing.
//!
//! A binary frame is a 4-byte big-endian body length followed by the body.
//! Big-endian matters: an HTTP request line starting with `GET` or `POST`
//! reads as a length of over a gigabyte, so the two framings never collide
//! on a sniffed prefix.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::serial::{self, CodecError};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Returns the total frame length (prefix included) announced by `buf`,
/// or `None` if fewer than [`LENGTH_PREFIX_LEN`] bytes are available.
#[must_use]
pub fn frame_length(buf: &[u8]) -> Option<usize> {
    let prefix: [u8; LENGTH_PREFIX_LEN] = buf.get(..LENGTH_PREFIX_LEN)?.try_into().ok()?;
    let body = u32::from_be_bytes(prefix) as usize;
    Some(LENGTH_PREFIX_LEN + body)
}

/// Prepends the length prefix to `body`.
///
/// # Errors
///
/// Returns `CodecError::FrameTooLarge` if the body length does not fit a `u32`.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = u32::try_from(body.len()).map_err(|_| CodecError::FrameTooLarge(body.len()))?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Returns the body of the complete frame at the start of `buf`.
///
/// Bytes after the announced length are ignored.
///
/// # Errors
///
/// Returns `CodecError::Truncated` if `buf` holds less than one full frame.
pub fn frame_body(buf: &[u8]) -> Result<&[u8], CodecError> {
    let total = frame_length(buf).ok_or(CodecError::Truncated {
        expected: LENGTH_PREFIX_LEN,
        actual: buf.len(),
    })?;
    buf.get(LENGTH_PREFIX_LEN..total)
        .ok_or(CodecError::Truncated {
            expected: total,
            actual: buf.len(),
        })
}

/// Encodes `value` as `MsgPack` and frames it.
///
/// # Errors
///
/// Propagates encoding and framing failures.
pub fn to_frame<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    encode_frame(&serial::to_binary(value)?)
}

/// Decodes the `MsgPack` value carried by the frame at the start of `buf`.
///
/// # Errors
///
/// Returns `CodecError::Truncated` for a partial frame, or a decode error.
pub fn from_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<T, CodecError> {
    serial::from_binary(frame_body(buf)?)
}
