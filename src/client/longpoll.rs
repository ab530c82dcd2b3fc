//! Long-poll agent: the HTTP-only fallback transport.
//!
//! Where the persistent transport can't be used (WebSocket-hostile
//! middleboxes), the agent registers over plain HTTP and then loops:
//! poll for one frame, handle it, POST the response frames back one by
//! one. Responses are posted sequentially, which preserves head-then-chunks
//! ordering on the gateway side.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::forward;
use crate::config::ClientConfig;
use crate::protocol::{TunnelFrame, KIND_HTTP_REQ};

/// Client-side request timeout; comfortably above the gateway's 30 s hold.
const POLL_TIMEOUT: Duration = Duration::from_secs(65);

/// Backoff after a poll or registration failure.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Frames buffered between the request handler and the response POSTs.
const RESPONSE_QUEUE_CAPACITY: usize = 16;

/// Run the long-poll agent forever: register, poll, re-register on failure.
pub async fn run(config: ClientConfig) {
    let client = reqwest::Client::builder()
        .timeout(POLL_TIMEOUT)
        .danger_accept_invalid_certs(config.insecure)
        .build()
        .expect("reqwest client builds");
    let base = config.server_url.trim_end_matches('/').to_string();

    loop {
        if let Err(e) = register(&client, &base, &config.key).await {
            warn!(error = %e, "long-poll registration failed, retrying");
            tokio::time::sleep(RETRY_DELAY).await;
            continue;
        }
        info!(key = %config.key, "long-poll tunnel registered");

        loop {
            if let Err(e) = poll_once(&client, &base, &config).await {
                warn!(error = %e, "polling error, re-registering");
                tokio::time::sleep(RETRY_DELAY).await;
                break;
            }
        }
    }
}

async fn register(
    client: &reqwest::Client,
    base: &str,
    key: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let resp = client
        .post(format!("{base}/http-tunnel/register/{key}"))
        .send()
        .await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(format!("registration failed: {status}: {body}").into());
    }
    Ok(())
}

/// One poll cycle: wait for a frame (or 204) and handle it inline.
async fn poll_once(
    client: &reqwest::Client,
    base: &str,
    config: &ClientConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let resp = client
        .get(format!("{base}/http-tunnel/poll/{}", config.key))
        .send()
        .await?;

    match resp.status().as_u16() {
        204 => Ok(()),
        200 => {
            let body = resp.bytes().await?;
            let frame = TunnelFrame::decode(body)?;
            if frame.kind != KIND_HTTP_REQ {
                debug!(kind = frame.kind, "ignoring non-request frame from poll");
                return Ok(());
            }
            handle_polled_request(client, base, config, frame).await;
            Ok(())
        }
        404 => Err("tunnel no longer registered".into()),
        status => Err(format!("unexpected poll status {status}").into()),
    }
}

/// Forward one request to the local target, POSTing each produced frame
/// back to the gateway in order.
async fn handle_polled_request(
    client: &reqwest::Client,
    base: &str,
    config: &ClientConfig,
    frame: TunnelFrame,
) {
    let request_id = frame.id;
    let (out_tx, mut out_rx) = mpsc::channel::<TunnelFrame>(RESPONSE_QUEUE_CAPACITY);
    let producer = tokio::spawn(forward::handle_request(
        client.clone(),
        config.target_addr.clone(),
        frame,
        out_tx,
    ));

    let url = format!("{base}/http-tunnel/response/{}", config.key);
    while let Some(response_frame) = out_rx.recv().await {
        let post = client
            .post(&url)
            .header("content-type", "application/octet-stream")
            .body(response_frame.encode())
            .send()
            .await;
        match post {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                warn!(request_id, status = %resp.status(), "gateway refused response frame");
                break;
            }
            Err(e) => {
                warn!(request_id, error = %e, "failed to post response frame");
                break;
            }
        }
    }
    producer.abort();
    debug!(request_id, "polled request finished");
}
