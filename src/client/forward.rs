//! Local-target fetch, shared by both agent transports.
//!
//! A kind-1 frame is parsed back into an HTTP request, issued against the
//! configured local target, and the response is turned into frames: one
//! kind-2 head, kind-3 chunks as body bytes arrive, and the empty sentinel.
//! Frames go out through a bounded channel; the owning transport decides
//! how they reach the gateway.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::http::{is_hop_by_hop, parse_request, serialize_response_head};
use crate::protocol::TunnelFrame;

/// Timeout for the whole local-target exchange, like the original forwarder.
pub const TARGET_TIMEOUT: Duration = Duration::from_secs(30);

/// Response bodies are re-framed into chunks no larger than this.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// If the response head cannot be queued within this long, the transport is
/// wedged and the request is abandoned.
const HEAD_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle one tunneled request end to end. Produces zero frames when the
/// request cannot be parsed or the target is unreachable — the gateway's
/// deadline owns that failure.
pub async fn handle_request(
    client: reqwest::Client,
    target_addr: String,
    frame: TunnelFrame,
    out_tx: mpsc::Sender<TunnelFrame>,
) {
    let id = frame.id;
    let request = match parse_request(&frame.payload) {
        Ok(request) => request,
        Err(e) => {
            warn!(request_id = id, error = %e, "failed to parse tunneled request");
            return;
        }
    };
    debug!(
        request_id = id,
        method = %request.method,
        target = %request.target,
        "handling tunneled request"
    );

    let url = format!("http://{}{}", target_addr, request.target);
    let mut outbound = client
        .request(
            request.method.parse().unwrap_or(reqwest::Method::GET),
            &url,
        )
        .timeout(TARGET_TIMEOUT);
    for (name, value) in &request.headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
            continue;
        }
        outbound = outbound.header(name.as_str(), value.as_str());
    }
    if !request.body.is_empty() {
        outbound = outbound.body(request.body.clone());
    }

    let response = match outbound.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(request_id = id, url = %url, error = %e, "failed to forward request to target");
            return;
        }
    };

    let status = response.status();
    let head = serialize_response_head(
        status,
        response.headers().iter().map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        }),
    );
    let head_frame = TunnelFrame::response_head(id, head);
    if out_tx
        .send_timeout(head_frame, HEAD_ENQUEUE_TIMEOUT)
        .await
        .is_err()
    {
        warn!(request_id = id, "could not queue response head, dropping request");
        return;
    }
    debug!(request_id = id, status = %status, "response head queued");

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(request_id = id, error = %e, "error reading target response body");
                // No sentinel: the gateway treats the stream as truncated.
                return;
            }
        };
        for piece in split_chunks(id, chunk) {
            if out_tx.send(piece).await.is_err() {
                return;
            }
        }
    }

    let _ = out_tx.send(TunnelFrame::end_of_stream(id)).await;
    debug!(request_id = id, "response stream finished");
}

/// Split oversized chunks so a single frame never balloons.
fn split_chunks(id: u64, mut data: Bytes) -> Vec<TunnelFrame> {
    let mut frames = Vec::with_capacity(data.len() / CHUNK_SIZE + 1);
    while !data.is_empty() {
        frames.push(TunnelFrame::chunk(id, data.split_to(data.len().min(CHUNK_SIZE))));
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_chunks_bounds_frame_size() {
        let data = Bytes::from(vec![7u8; CHUNK_SIZE * 2 + 10]);
        let frames = split_chunks(3, data);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.payload.len() <= CHUNK_SIZE));
        assert_eq!(
            frames.iter().map(|f| f.payload.len()).sum::<usize>(),
            CHUNK_SIZE * 2 + 10
        );
        assert!(frames.iter().all(|f| f.id == 3 && !f.is_end_of_stream()));
    }
}
