//! Payload serializer contract shared by servers and clients.
//!
//! Binary payloads are compact `MsgPack` (`rmp_serde::to_vec`): struct fields
//! are written positionally, so the declaration order of a payload type is
//! part of its wire format. JSON payloads go through `serde_json`.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors produced while encoding or decoding payloads and frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("msgpack encode failed: {0}")]
    BinaryEncode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode failed: {0}")]
    BinaryDecode(#[from] rmp_serde::decode::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("frame body of {0} bytes does not fit a u32 length prefix")]
    FrameTooLarge(usize),
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// Encodes a value as compact `MsgPack`.
///
/// # Errors
///
/// Returns `CodecError::BinaryEncode` if the value cannot be represented.
pub fn to_binary<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec(value)?)
}

/// Decodes a compact `MsgPack` value.
///
/// # Errors
///
/// Returns `CodecError::BinaryDecode` if the bytes do not match `T`.
pub fn from_binary<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Encodes a value as JSON, optionally pretty-printed.
///
/// # Errors
///
/// Returns `CodecError::Json` if serialization fails (e.g. non-string map keys).
pub fn to_json<T: Serialize + ?Sized>(value: &T, pretty: bool) -> Result<String, CodecError> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    Ok(text)
}

/// Decodes a JSON value.
///
/// # Errors
///
/// Returns `CodecError::Json` carrying the parser's message on failure.
pub fn from_json<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    Ok(serde_json::from_str(text)?)
}
