//! Request framing for the shared binary/HTTP socket.
//!
//! Every connection carries either length-prefixed binary RPC frames or
//! HTTP requests. Which one applies is sniffed from the first bytes of the
//! buffered request: `GET` and `POST` select HTTP, everything else is binary.
//! Framing never fails on malformed input; it just reports "incomplete" and
//! lets the connection's read timeout close the socket.

use bytes::{Bytes, BytesMut};
use rpcserve_core::frame;
use tokio_util::codec::{Decoder, Encoder};

/// Wire framing of a buffered request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Binary,
    Http,
}

/// A complete request found at the start of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub framing: Framing,
    /// Bytes belonging to this request, counted from the start of the buffer.
    pub len: usize,
}

/// Decides which framing applies to `buf`.
#[must_use]
pub fn sniff(buf: &[u8]) -> Framing {
    if buf.starts_with(b"GET") || buf.starts_with(b"POST") {
        Framing::Http
    } else {
        Framing::Binary
    }
}

/// Returns the request at the start of `buf` if it has fully arrived.
#[must_use]
pub fn is_complete(buf: &[u8]) -> Option<FrameInfo> {
    let framing = sniff(buf);
    let len = match framing {
        Framing::Binary => frame::frame_length(buf).filter(|&total| buf.len() >= total)?,
        Framing::Http => http_request_length(buf)?,
    };
    Some(FrameInfo { framing, len })
}

/// Offset just past the blank line that ends the HTTP header block.
///
/// Accepts both `\r\n\r\n` and bare `\n\n`, whichever comes first.
#[must_use]
pub fn header_end(buf: &[u8]) -> Option<usize> {
    let crlf = find(buf, b"\r\n\r\n").map(|pos| (pos, 4));
    let lf = find(buf, b"\n\n").map(|pos| (pos, 2));
    let (pos, term) = match (crlf, lf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    Some(pos + term)
}

/// Length of a complete HTTP request, or `None` while bytes are missing.
///
/// A POST without a usable `Content-Length` waits for one body byte.
fn http_request_length(buf: &[u8]) -> Option<usize> {
    let header_len = header_end(buf)?;
    if !buf.starts_with(b"POST") {
        return Some(header_len);
    }
    let body_len = content_length(&buf[..header_len]).unwrap_or(1);
    let total = header_len.checked_add(body_len)?;
    (buf.len() >= total).then_some(total)
}

/// Parses the `Content-Length` header out of a raw header block.
#[must_use]
pub fn content_length(header_block: &[u8]) -> Option<usize> {
    header_block.split(|&b| b == b'\n').find_map(|line| {
        let line = std::str::from_utf8(line).ok()?;
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// ---------------------------------------------------------------------------
// RequestCodec
// ---------------------------------------------------------------------------

/// One framed request read off a connection.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub framing: Framing,
    pub bytes: Bytes,
    /// `false` for the leftover partial request handed over at end of stream.
    pub complete: bool,
}

/// Errors that end a connection's read loop.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("request exceeds the {limit} byte limit")]
    TooLarge { limit: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// `tokio_util` codec splitting a byte stream into framed requests.
///
/// Replies are written back verbatim through the `Encoder` half.
#[derive(Debug, Clone)]
pub struct RequestCodec {
    max_request_size: usize,
}

impl RequestCodec {
    #[must_use]
    pub fn new(max_request_size: usize) -> Self {
        Self { max_request_size }
    }
}

impl Decoder for RequestCodec {
    type Item = RawRequest;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawRequest>, FrameError> {
        let limit = self.max_request_size;
        if src.len() > limit {
            return Err(FrameError::TooLarge { limit });
        }
        if let Some(info) = is_complete(src) {
            let bytes = src.split_to(info.len).freeze();
            return Ok(Some(RawRequest {
                framing: info.framing,
                bytes,
                complete: true,
            }));
        }
        if sniff(src) == Framing::Binary {
            if let Some(total) = frame::frame_length(src) {
                if total > limit {
                    return Err(FrameError::TooLarge { limit });
                }
                src.reserve(total - src.len());
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<RawRequest>, FrameError> {
        if let Some(request) = self.decode(src)? {
            return Ok(Some(request));
        }
        if src.is_empty() {
            return Ok(None);
        }
        Ok(Some(RawRequest {
            framing: sniff(src),
            bytes: src.split().freeze(),
            complete: false,
        }))
    }
}

impl Encoder<Bytes> for RequestCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn sniff_selects_http_by_verb() {
        assert_eq!(sniff(b"GET / HTTP/1.1"), Framing::Http);
        assert_eq!(sniff(b"POST /ADD HTTP/1.1"), Framing::Http);
        assert_eq!(sniff(b"PUT / HTTP/1.1"), Framing::Binary);
        assert_eq!(sniff(&[0, 0, 0, 3, 1, 2, 3]), Framing::Binary);
    }

    #[test]
    fn twelve_byte_binary_frame() {
        let frame = frame::encode_frame(&[7u8; 8]).unwrap();
        assert_eq!(frame.len(), 12);
        assert_eq!(is_complete(&frame[..5]), None);
        assert_eq!(is_complete(&frame[..11]), None);
        assert_eq!(
            is_complete(&frame),
            Some(FrameInfo {
                framing: Framing::Binary,
                len: 12
            })
        );
    }

    #[test]
    fn get_completes_at_end_of_headers() {
        let req = b"GET /_usage HTTP/1.1\r\nHost: x\r\n\r\nignored body";
        let info = is_complete(req).unwrap();
        assert_eq!(info.framing, Framing::Http);
        assert_eq!(info.len, req.len() - "ignored body".len());
        assert_eq!(is_complete(b"GET / HTTP/1.1\r\nHost: x\r\n"), None);
    }

    #[test]
    fn bare_newlines_end_headers() {
        let req = b"GET / HTTP/1.0\nHost: x\n\n";
        assert_eq!(is_complete(req).unwrap().len, req.len());
    }

    #[test]
    fn earliest_terminator_wins() {
        let req = b"GET / HTTP/1.0\n\nHost: x\r\n\r\n";
        assert_eq!(header_end(req), Some(16));
    }

    #[test]
    fn post_waits_for_content_length_body() {
        let head = b"POST /ADD HTTP/1.1\r\ncontent-length: 5\r\n\r\n";
        let mut req = head.to_vec();
        assert_eq!(is_complete(&req), None);
        req.extend_from_slice(b"q=12");
        assert_eq!(is_complete(&req), None);
        req.push(b'3');
        assert_eq!(is_complete(&req).unwrap().len, head.len() + 5);
    }

    #[test]
    fn post_without_length_needs_one_more_byte() {
        let head = b"POST /ADD HTTP/1.1\r\nHost: x\r\n\r\n".to_vec();
        assert_eq!(is_complete(&head), None);
        let mut req = head.clone();
        req.push(b'x');
        assert_eq!(is_complete(&req).unwrap().len, head.len() + 1);
    }

    #[test]
    fn content_length_in_body_is_ignored() {
        let req = b"POST / HTTP/1.1\r\n\r\nContent-Length: 100\r\n";
        assert_eq!(is_complete(req).unwrap().len, 20);
    }

    #[test]
    fn codec_splits_pipelined_requests() {
        let mut codec = RequestCodec::new(1024);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame::encode_frame(b"one").unwrap());
        buf.extend_from_slice(b"GET / HTTP/1.1\r\n\r\n");

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.framing, Framing::Binary);
        assert_eq!(&first.bytes[4..], b"one");

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.framing, Framing::Http);
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_rejects_oversized_buffers() {
        let mut codec = RequestCodec::new(16);
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: example.com"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::TooLarge { limit: 16 })
        ));
    }

    #[test]
    fn codec_rejects_oversized_announced_frames() {
        let mut codec = RequestCodec::new(64);
        let mut buf = BytesMut::from(&[0u8, 0, 1, 0][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn codec_hands_over_partial_request_at_eof() {
        let mut codec = RequestCodec::new(1024);
        let mut buf = BytesMut::from(&b"POST /ADD HTTP/1.1\r\n"[..]);
        let partial = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert!(!partial.complete);
        assert_eq!(partial.framing, Framing::Http);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    proptest! {
        #[test]
        fn binary_prefix_is_incomplete_until_last_byte(body in proptest::collection::vec(any::<u8>(), 0..256)) {
            let frame = frame::encode_frame(&body).unwrap();
            let total = frame.len();
            for cut in 0..total {
                let prefix = &frame[..cut];
                if sniff(prefix) == Framing::Binary {
                    prop_assert_eq!(is_complete(prefix), None);
                }
            }
            prop_assert_eq!(is_complete(&frame).map(|info| info.len), Some(total));
        }

        #[test]
        fn post_completes_exactly_at_header_plus_body(n in 0usize..200) {
            let head = format!("POST /op HTTP/1.1\r\nContent-Length: {n}\r\n\r\n");
            let mut req = head.clone().into_bytes();
            req.extend(std::iter::repeat(b'a').take(n));
            for cut in 0..req.len() {
                prop_assert_eq!(is_complete(&req[..cut]), None);
            }
            prop_assert_eq!(is_complete(&req).map(|info| info.len), Some(head.len() + n));
        }
    }
}
