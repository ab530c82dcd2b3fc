//! The agent: dials out of the private network and carries tunneled
//! requests to a local target service.
//!
//! Default transport is the persistent WebSocket: connect to
//! `<server>/ws/<key>`, keep a single writer task over a bounded queue,
//! ping every 15 seconds, and reconnect with exponential backoff when the
//! connection drops. The long-poll fallback lives in [`longpoll`].

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::protocol::{TunnelFrame, FRAME_HEADER_LEN, KIND_HTTP_REQ, MAX_FRAME_PAYLOAD};

pub mod forward;
pub mod longpoll;

/// Outbound frames buffered between request handlers and the writer.
const WRITE_QUEUE_CAPACITY: usize = 256;

/// Ping cadence toward the gateway.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Give up on the connection if nothing (data or pong) arrives for this long.
const READ_DEADLINE: Duration = Duration::from_secs(90);

/// Initial reconnect backoff; doubles up to [`RECONNECT_MAX_DELAY`].
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Run the persistent-transport agent forever, reconnecting as needed.
pub async fn run(config: ClientConfig) {
    let http_client = local_client(&config);
    let mut delay = RECONNECT_DELAY;

    loop {
        info!(server = %config.server_url, key = %config.key, "connecting to gateway");
        match connect_and_run(&config, http_client.clone()).await {
            Ok(()) => {
                info!("connection closed, reconnecting");
                delay = RECONNECT_DELAY;
            }
            Err(e) => {
                warn!(error = %e, delay_secs = delay.as_secs(), "connection failed, will retry");
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
    }
}

/// The reqwest client used against the local target. `insecure` is carried
/// for targets fronted by self-signed TLS, mirroring the gateway-side knob.
pub(crate) fn local_client(config: &ClientConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(config.insecure)
        .build()
        .expect("reqwest client builds")
}

/// One connection lifetime: dial, register by URL path, pump frames.
async fn connect_and_run(
    config: &ClientConfig,
    http_client: reqwest::Client,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let url = format!(
        "{}/ws/{}",
        config.server_url.trim_end_matches('/'),
        config.key
    );

    let connector = if config.insecure {
        Some(Connector::NativeTls(
            native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()?,
        ))
    } else {
        None
    };

    let ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default()
        .max_message_size(Some(FRAME_HEADER_LEN + MAX_FRAME_PAYLOAD))
        .max_frame_size(Some(FRAME_HEADER_LEN + MAX_FRAME_PAYLOAD));
    let (ws_stream, _response) =
        connect_async_tls_with_config(&url, Some(ws_config), false, connector).await?;
    info!(key = %config.key, "tunnel established");

    let (ws_sink, ws_stream) = ws_stream.split();
    let (out_tx, out_rx) = mpsc::channel::<TunnelFrame>(WRITE_QUEUE_CAPACITY);

    let writer = tokio::spawn(write_loop(ws_sink, out_rx));
    read_loop(ws_stream, config, http_client, out_tx).await;
    writer.abort();
    Ok(())
}

/// The single writer: every outbound byte on the socket goes through here,
/// so response frames and keepalive pings never interleave mid-message.
async fn write_loop(
    mut ws_sink: futures_util::stream::SplitSink<WsStream, Message>,
    mut out_rx: mpsc::Receiver<TunnelFrame>,
) {
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                if ws_sink.send(Message::Binary(frame.encode())).await.is_err() {
                    warn!("error writing to gateway, stopping writer");
                    break;
                }
            }
            _ = keepalive.tick() => {
                if ws_sink.send(Message::Ping(bytes::Bytes::new())).await.is_err() {
                    warn!("keepalive failed, stopping writer");
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    mut ws_stream: futures_util::stream::SplitStream<WsStream>,
    config: &ClientConfig,
    http_client: reqwest::Client,
    out_tx: mpsc::Sender<TunnelFrame>,
) {
    let mut deadline = Instant::now() + READ_DEADLINE;

    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {
                warn!("read deadline elapsed without pong, dropping connection");
                return;
            }
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let frame = match TunnelFrame::decode(data) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(error = %e, "bad frame from gateway, dropping connection");
                                return;
                            }
                        };
                        if frame.kind == KIND_HTTP_REQ {
                            // Each request runs independently; the shared
                            // queue serializes their outbound frames.
                            tokio::spawn(forward::handle_request(
                                http_client.clone(),
                                config.target_addr.clone(),
                                frame,
                                out_tx.clone(),
                            ));
                        } else {
                            debug!(kind = frame.kind, "ignoring non-request frame from gateway");
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        deadline = Instant::now() + READ_DEADLINE;
                    }
                    // The WebSocket layer answers pings on the next flush.
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Text(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        info!("gateway closed the connection");
                        return;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "connection error");
                        return;
                    }
                }
            }
        }
    }
}
