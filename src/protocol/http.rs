//! Raw HTTP/1.1 wire forms used as frame payloads.
//!
//! A kind-1 payload is a full request in wire form — request line, header
//! block, blank line, body. The request-target is the path and query of the
//! original public request; scheme and host are meaningless to the agent's
//! local target and are not carried. A kind-2 payload is a response head
//! only: status line + headers + blank line, no body bytes.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;

/// Headers that are connection-scoped and must not travel through the
/// tunnel or the forward proxy.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Wire-form parse failure.
#[derive(Debug)]
pub enum WireError {
    /// The head is truncated (no terminating blank line).
    Incomplete,
    /// httparse rejected the head.
    Malformed(httparse::Error),
    /// The status code is outside the representable range.
    BadStatus(u16),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Incomplete => write!(f, "incomplete HTTP head"),
            Self::Malformed(e) => write!(f, "malformed HTTP head: {e}"),
            Self::BadStatus(code) => write!(f, "invalid status code {code}"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<httparse::Error> for WireError {
    fn from(e: httparse::Error) -> Self {
        Self::Malformed(e)
    }
}

/// Serialize a public request into a kind-1 payload.
///
/// The body has already been read in full, so `Transfer-Encoding` is
/// dropped and a `Content-Length` is synthesized when one is missing.
pub fn serialize_request(method: &str, target: &str, headers: &HeaderMap, body: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(256 + body.len());
    buf.extend_from_slice(format!("{method} {target} HTTP/1.1\r\n").as_bytes());

    let mut has_content_length = false;
    for (name, value) in headers {
        if name.as_str().eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        if name.as_str().eq_ignore_ascii_case("content-length") {
            has_content_length = true;
        }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    if !body.is_empty() && !has_content_length {
        buf.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(body);
    Bytes::from(buf)
}

/// A request recovered from a kind-1 payload on the agent side.
#[derive(Debug)]
pub struct ParsedRequest {
    pub method: String,
    /// Path and query, e.g. `/hello?x=1`.
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Parse a kind-1 payload back into its parts.
pub fn parse_request(data: &Bytes) -> Result<ParsedRequest, WireError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(data)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Err(WireError::Incomplete),
    };

    let method = req.method.ok_or(WireError::Incomplete)?.to_string();
    let target = req.path.ok_or(WireError::Incomplete)?.to_string();
    let headers = req
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();

    Ok(ParsedRequest {
        method,
        target,
        headers,
        body: data.slice(head_len..),
    })
}

/// A response head recovered from a kind-2 payload on the gateway side.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Serialize a response head into a kind-2 payload (agent side).
///
/// `Transfer-Encoding` is dropped: body bytes travel as kind-3 chunk frames
/// and any chunked coding was already decoded by the fetch.
pub fn serialize_response_head(
    status: StatusCode,
    headers: impl Iterator<Item = (String, String)>,
) -> Bytes {
    let mut buf = Vec::with_capacity(256);
    let reason = status.canonical_reason().unwrap_or("");
    buf.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason).as_bytes());
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    Bytes::from(buf)
}

/// Parse a kind-2 payload. Header entries httparse accepts but the `http`
/// types reject (exotic bytes) are skipped rather than failing the frame.
pub fn parse_response_head(data: &[u8]) -> Result<ResponseHead, WireError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut res = httparse::Response::new(&mut headers);
    match res.parse(data)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(WireError::Incomplete),
    }

    let code = res.code.ok_or(WireError::Incomplete)?;
    let status = StatusCode::from_u16(code).map_err(|_| WireError::BadStatus(code))?;

    let mut map = HeaderMap::with_capacity(res.headers.len());
    for h in res.headers.iter() {
        let Ok(name) = HeaderName::from_bytes(h.name.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_bytes(h.value) else {
            continue;
        };
        map.append(name, value);
    }

    Ok(ResponseHead { status, headers: map })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;

    #[test]
    fn test_request_roundtrip() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("example.com"));
        headers.insert("x-tunnel-key", HeaderValue::from_static("alpha"));

        let wire = serialize_request("POST", "/submit?a=1", &headers, b"hello");
        assert!(wire.starts_with(b"POST /submit?a=1 HTTP/1.1\r\n"));

        let parsed = parse_request(&wire).unwrap();
        assert_eq!(parsed.method, "POST");
        assert_eq!(parsed.target, "/submit?a=1");
        assert_eq!(parsed.body.as_ref(), b"hello");
        assert!(parsed
            .headers
            .iter()
            .any(|(n, v)| n.eq_ignore_ascii_case("host") && v == "example.com"));
    }

    #[test]
    fn test_serialize_request_synthesizes_content_length() {
        let wire = serialize_request("PUT", "/x", &HeaderMap::new(), b"abcd");
        let parsed = parse_request(&wire).unwrap();
        assert!(parsed
            .headers
            .iter()
            .any(|(n, v)| n.eq_ignore_ascii_case("content-length") && v == "4"));
    }

    #[test]
    fn test_serialize_request_drops_transfer_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );
        let wire = serialize_request("GET", "/", &headers, b"");
        let parsed = parse_request(&wire).unwrap();
        assert!(!parsed
            .headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case("transfer-encoding")));
    }

    #[test]
    fn test_response_head_roundtrip() {
        let head = serialize_response_head(
            StatusCode::OK,
            vec![("Content-Length".to_string(), "2".to_string())].into_iter(),
        );
        assert!(head.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(head.ends_with(b"\r\n\r\n"));

        let parsed = parse_response_head(&head).unwrap();
        assert_eq!(parsed.status, StatusCode::OK);
        assert_eq!(parsed.headers.get(header::CONTENT_LENGTH).unwrap(), "2");
    }

    #[test]
    fn test_parse_response_head_rejects_garbage() {
        assert!(parse_response_head(b"not http at all\r\n\r\n").is_err());
        assert!(matches!(
            parse_response_head(b"HTTP/1.1 200 OK\r\n"),
            Err(WireError::Incomplete)
        ));
    }

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(!is_hop_by_hop("content-type"));
    }
}
