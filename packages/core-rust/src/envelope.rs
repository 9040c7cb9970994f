//! Request and reply envelopes exchanged by the binary RPC protocol.
//!
//! Both envelopes are encoded positionally (see [`crate::serial`]), so the
//! field order below is the wire order. HTTP-wrapped calls carry the same
//! logical fields in the request line, headers, and query string instead.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::frame;
use crate::serial::{self, CodecError};
use crate::status::ErrorMessage;

// ---------------------------------------------------------------------------
// HeaderMap
// ---------------------------------------------------------------------------

/// HTTP header map with case-insensitive keys.
///
/// Keys are stored lower-cased, including keys that arrive over the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct HeaderMap(BTreeMap<String, String>);

impl HeaderMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, replacing any previous value for the same name.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Inserts a header only if no value exists for that name yet.
    pub fn insert_if_absent(&mut self, name: &str, value: impl Into<String>) {
        self.0
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates headers in name order. Names are lower-case.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl From<BTreeMap<String, String>> for HeaderMap {
    fn from(raw: BTreeMap<String, String>) -> Self {
        Self(
            raw.into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
        )
    }
}

impl From<HeaderMap> for BTreeMap<String, String> {
    fn from(map: HeaderMap) -> Self {
        map.0
    }
}

// ---------------------------------------------------------------------------
// RequestEnvelope
// ---------------------------------------------------------------------------

/// A single RPC call as it travels over the binary protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Registered operation name. Empty for HTTP calls, which carry it in the path.
    pub opname: String,
    /// Encoded typed input.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub referrer: String,
    /// Raw `Cookie` header value.
    pub cookie: String,
    pub http_header: HeaderMap,
    /// CGI-style arguments (`mock`, `d`, ...).
    pub arg_map: BTreeMap<String, String>,
}

impl RequestEnvelope {
    #[must_use]
    pub fn new(opname: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            opname: opname.into(),
            payload,
            ..Self::default()
        }
    }

    /// Builds a request whose payload is the binary encoding of `input`.
    ///
    /// # Errors
    ///
    /// Returns a `CodecError` if `input` cannot be encoded.
    pub fn with_input<T: Serialize + ?Sized>(
        opname: impl Into<String>,
        input: &T,
    ) -> Result<Self, CodecError> {
        Ok(Self::new(opname, serial::to_binary(input)?))
    }

    /// Folds transport metadata from `other` into this request.
    ///
    /// An existing referrer is kept. `other`'s cookie string is prepended so
    /// that cookies already on this request win when names repeat. Header and
    /// argument entries are added without overwriting existing ones.
    pub fn merge_metadata(&mut self, other: &RequestEnvelope) {
        if self.referrer.is_empty() {
            self.referrer.clone_from(&other.referrer);
        }
        if !other.cookie.is_empty() {
            self.cookie = if self.cookie.is_empty() {
                other.cookie.clone()
            } else {
                format!("{}; {}", other.cookie, self.cookie)
            };
        }
        for (name, value) in other.http_header.iter() {
            self.http_header.insert_if_absent(name, value);
        }
        for (key, value) in &other.arg_map {
            self.arg_map
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// Encodes this request as a length-prefixed frame.
    ///
    /// # Errors
    ///
    /// Propagates encoding failures.
    pub fn to_frame(&self) -> Result<Vec<u8>, CodecError> {
        frame::to_frame(self)
    }

    /// Decodes a request from the frame at the start of `buf`.
    ///
    /// # Errors
    ///
    /// Returns a `CodecError` for partial frames or malformed envelopes.
    pub fn from_frame(buf: &[u8]) -> Result<Self, CodecError> {
        frame::from_frame(buf)
    }
}

// ---------------------------------------------------------------------------
// ReplyEnvelope
// ---------------------------------------------------------------------------

/// The answer to a [`RequestEnvelope`].
///
/// On failure the payload carries an encoded [`ErrorMessage`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub success: bool,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Fully formatted `Set-Cookie` values, in emission order.
    pub cookies: Vec<String>,
}

impl ReplyEnvelope {
    #[must_use]
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            success: true,
            payload,
            cookies: Vec::new(),
        }
    }

    #[must_use]
    pub fn failed(payload: Vec<u8>) -> Self {
        Self {
            success: false,
            payload,
            cookies: Vec::new(),
        }
    }

    /// Decodes a binary-encoded output.
    ///
    /// # Errors
    ///
    /// Returns a `CodecError` if the payload is not a `T`.
    pub fn output<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serial::from_binary(&self.payload)
    }

    /// Decodes the binary-encoded error carried by a failed reply.
    ///
    /// A payload that is not an [`ErrorMessage`] is reported as raw text.
    #[must_use]
    pub fn error_message(&self) -> String {
        serial::from_binary::<ErrorMessage>(&self.payload).map_or_else(
            |_| String::from_utf8_lossy(&self.payload).into_owned(),
            |err| err.error_msg,
        )
    }

    /// # Errors
    ///
    /// Propagates encoding failures.
    pub fn to_frame(&self) -> Result<Vec<u8>, CodecError> {
        frame::to_frame(self)
    }

    /// # Errors
    ///
    /// Returns a `CodecError` for partial frames or malformed envelopes.
    pub fn from_frame(buf: &[u8]) -> Result<Self, CodecError> {
        frame::from_frame(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_map_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("User-Agent", "curl");
        assert_eq!(headers.get("user-agent"), Some("curl"));
        assert_eq!(headers.get("USER-AGENT"), Some("curl"));
        headers.insert_if_absent("user-AGENT", "other");
        assert_eq!(headers.get("User-Agent"), Some("curl"));
    }

    #[test]
    fn header_map_normalises_decoded_keys() {
        let mut raw = BTreeMap::new();
        raw.insert("X-Forwarded-For".to_string(), "10.0.0.1".to_string());
        let bytes = serial::to_binary(&raw).unwrap();
        let headers: HeaderMap = serial::from_binary(&bytes).unwrap();
        assert_eq!(headers.get("x-forwarded-for"), Some("10.0.0.1"));
    }

    #[test]
    fn merge_keeps_existing_referrer_and_prepends_cookie() {
        let mut own = RequestEnvelope::new("ADD", vec![1]);
        own.referrer = "http://own".into();
        own.cookie = "a=1".into();
        own.arg_map.insert("mock".into(), "*:1".into());

        let mut http = RequestEnvelope::default();
        http.referrer = "http://outer".into();
        http.cookie = "a=0; b=2".into();
        http.http_header.insert("Host", "example");
        http.arg_map.insert("mock".into(), "*:2".into());
        http.arg_map.insert("d".into(), "1".into());

        own.merge_metadata(&http);
        assert_eq!(own.referrer, "http://own");
        assert_eq!(own.cookie, "a=0; b=2; a=1");
        assert_eq!(own.http_header.get("host"), Some("example"));
        assert_eq!(own.arg_map["mock"], "*:1");
        assert_eq!(own.arg_map["d"], "1");
    }

    #[test]
    fn merge_fills_empty_referrer() {
        let mut own = RequestEnvelope::default();
        let other = RequestEnvelope {
            referrer: "http://outer".into(),
            cookie: "s=1".into(),
            ..RequestEnvelope::default()
        };
        own.merge_metadata(&other);
        assert_eq!(own.referrer, "http://outer");
        assert_eq!(own.cookie, "s=1");
    }

    #[test]
    fn request_frame_preserves_every_field() {
        let mut req = RequestEnvelope::with_input("ADD", &(1, 10)).unwrap();
        req.cookie = "s=abc".into();
        req.http_header.insert("Host", "x");
        req.arg_map.insert("mock".into(), "*:42".into());
        let decoded = RequestEnvelope::from_frame(&req.to_frame().unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn failed_reply_exposes_error_text() {
        let payload = serial::to_binary(&ErrorMessage::new("boom")).unwrap();
        let reply = ReplyEnvelope::failed(payload);
        assert!(!reply.success);
        assert_eq!(reply.error_message(), "boom");

        let raw = ReplyEnvelope::failed(b"plain".to_vec());
        assert_eq!(raw.error_message(), "plain");
    }
}
