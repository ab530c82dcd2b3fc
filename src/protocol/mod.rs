//! Tunnel wire protocol.
//!
//! Every message exchanged with an agent — over the persistent WebSocket
//! transport or as a long-poll request/response body — is exactly one
//! [`TunnelFrame`]:
//!
//! ```text
//! offset 0..8   id       u64, big-endian
//! offset 8..9   kind     u8
//! offset 9..    payload  raw bytes, length implied by the message boundary
//! ```
//!
//! There is no intra-frame length field; the carrying transport delimits
//! frames. Payload contents by kind:
//!
//! | Kind | Name             | Payload                                      |
//! |------|------------------|----------------------------------------------|
//! | 1    | `HTTP_REQ`       | serialized HTTP/1.1 request (line + headers + body) |
//! | 2    | `HTTP_RES_HEAD`  | HTTP/1.1 status line + headers + blank line  |
//! | 3    | `HTTP_RES_CHUNK` | response body bytes; empty = end of stream   |

use bytes::Bytes;

pub mod http;

/// Frame carries a serialized HTTP request (gateway → agent).
pub const KIND_HTTP_REQ: u8 = 1;
/// Frame carries an HTTP response head (agent → gateway).
pub const KIND_HTTP_RES_HEAD: u8 = 2;
/// Frame carries response body bytes; empty payload ends the stream.
pub const KIND_HTTP_RES_CHUNK: u8 = 3;

/// Fixed frame header size: 8-byte id + 1-byte kind.
pub const FRAME_HEADER_LEN: usize = 9;

/// Largest frame payload the gateway accepts (10 MiB). A transport that
/// delivers a larger frame is torn down.
pub const MAX_FRAME_PAYLOAD: usize = 10 * 1024 * 1024;

/// One tunnel message. The `id` is the public request it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelFrame {
    pub id: u64,
    pub kind: u8,
    pub payload: Bytes,
}

/// Frame decode failure. Either is fatal for the carrying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than [`FRAME_HEADER_LEN`] bytes.
    Short(usize),
    /// Payload exceeds [`MAX_FRAME_PAYLOAD`].
    Oversize(usize),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Short(n) => write!(f, "frame too short: {n} bytes"),
            Self::Oversize(n) => write!(f, "frame payload too large: {n} bytes"),
        }
    }
}

impl std::error::Error for FrameError {}

impl TunnelFrame {
    pub fn request(id: u64, payload: Bytes) -> Self {
        Self { id, kind: KIND_HTTP_REQ, payload }
    }

    pub fn response_head(id: u64, payload: Bytes) -> Self {
        Self { id, kind: KIND_HTTP_RES_HEAD, payload }
    }

    pub fn chunk(id: u64, payload: Bytes) -> Self {
        Self { id, kind: KIND_HTTP_RES_CHUNK, payload }
    }

    /// The end-of-stream sentinel: a chunk frame with an empty payload.
    pub fn end_of_stream(id: u64) -> Self {
        Self::chunk(id, Bytes::new())
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.kind == KIND_HTTP_RES_CHUNK && self.payload.is_empty()
    }

    /// Encode into the 9-byte header + payload wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.push(self.kind);
        buf.extend_from_slice(&self.payload);
        Bytes::from(buf)
    }

    /// Decode one frame from a complete transport message.
    ///
    /// The payload is sliced out of `data` without copying.
    pub fn decode(data: Bytes) -> Result<Self, FrameError> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(FrameError::Short(data.len()));
        }
        let payload_len = data.len() - FRAME_HEADER_LEN;
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(FrameError::Oversize(payload_len));
        }
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&data[..8]);
        Ok(Self {
            id: u64::from_be_bytes(id_bytes),
            kind: data[8],
            payload: data.slice(FRAME_HEADER_LEN..),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let frame = TunnelFrame::request(42, Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"));
        let decoded = TunnelFrame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_rejects_short_input() {
        assert_eq!(TunnelFrame::decode(Bytes::new()), Err(FrameError::Short(0)));
        let eight = Bytes::from_static(&[0u8; 8]);
        assert_eq!(TunnelFrame::decode(eight), Err(FrameError::Short(8)));
    }

    #[test]
    fn test_header_only_frame_is_empty_payload() {
        // A 9-byte frame of kind 3 is the valid end-of-stream marker.
        let decoded = TunnelFrame::decode(TunnelFrame::end_of_stream(7).encode()).unwrap();
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.kind, KIND_HTTP_RES_CHUNK);
        assert!(decoded.payload.is_empty());
        assert!(decoded.is_end_of_stream());
    }

    #[test]
    fn test_id_is_big_endian() {
        let encoded = TunnelFrame::chunk(0x0102_0304_0506_0708, Bytes::new()).encode();
        assert_eq!(&encoded[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(encoded[8], KIND_HTTP_RES_CHUNK);
    }

    #[test]
    fn test_decode_rejects_oversize_payload() {
        let mut data = vec![0u8; FRAME_HEADER_LEN + MAX_FRAME_PAYLOAD + 1];
        data[8] = KIND_HTTP_RES_CHUNK;
        assert_eq!(
            TunnelFrame::decode(Bytes::from(data)),
            Err(FrameError::Oversize(MAX_FRAME_PAYLOAD + 1))
        );
    }
}
