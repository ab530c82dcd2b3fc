//! Pending-request table: in-flight public requests awaiting agent frames.
//!
//! Every dispatched public request owns one [`PendingSink`], keyed by its
//! request id. Response frames from the agent drive the sink through its
//! lifecycle: exactly one head (kind-2), any number of body chunks (kind-3),
//! and the empty-chunk sentinel that completes it. Timeouts, dispatch
//! failures, and agent replacement remove the sink and fail the waiting
//! public request.
//!
//! All state transitions happen under a single async mutex, so a frame
//! application can never race a removal. Chunk delivery awaits the bounded
//! body channel while holding the lock; the receiving side is the public
//! response body, which drains independently of this table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::protocol::http::{self, ResponseHead};
use crate::protocol::{TunnelFrame, KIND_HTTP_RES_CHUNK, KIND_HTTP_RES_HEAD};

/// How long a public request may stay in flight, from dispatch to the
/// end-of-stream sentinel.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(90);

/// Body chunks buffered between the agent reader and the public response.
const BODY_CHANNEL_CAPACITY: usize = 64;

/// Why a sink failed before its response head was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFailure {
    /// The agent's transport died, was replaced, or refused the frame.
    AgentGone,
    /// The 90-second deadline elapsed.
    TimedOut,
}

/// Items flowing into the public response body stream.
pub type BodyResult = Result<Bytes, std::io::Error>;

/// Receiving halves handed to the public handler at registration.
pub struct SinkReceivers {
    pub head_rx: oneshot::Receiver<Result<ResponseHead, SinkFailure>>,
    pub body_rx: mpsc::Receiver<BodyResult>,
}

struct PendingSink {
    /// Consumed by the first kind-2 frame; `None` afterwards.
    head_tx: Option<oneshot::Sender<Result<ResponseHead, SinkFailure>>>,
    body_tx: mpsc::Sender<BodyResult>,
    /// Registry epoch of the endpoint this request was dispatched through.
    endpoint_id: u64,
}

impl PendingSink {
    /// Signal failure on whichever side is still waiting.
    fn fail(mut self, reason: SinkFailure) {
        if let Some(head_tx) = self.head_tx.take() {
            let _ = head_tx.send(Err(reason));
        } else {
            // Headers already forwarded: the body is truncated mid-stream.
            let _ = self.body_tx.try_send(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "response stream interrupted",
            )));
        }
    }
}

/// The table itself, plus the process-wide request-id counter.
pub struct PendingTable {
    next_id: AtomicU64,
    sinks: Mutex<HashMap<u64, PendingSink>>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next request id. Strictly monotonic for the process
    /// lifetime, starting at 1.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a sink for `id`, routed through endpoint `endpoint_id`.
    pub async fn register(&self, id: u64, endpoint_id: u64) -> SinkReceivers {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        self.sinks.lock().await.insert(
            id,
            PendingSink {
                head_tx: Some(head_tx),
                body_tx,
                endpoint_id,
            },
        );
        SinkReceivers { head_rx, body_rx }
    }

    /// Drop the sink for `id` without signaling anything. Used when the
    /// dispatch itself failed and the handler still owns the error path.
    pub async fn remove(&self, id: u64) {
        self.sinks.lock().await.remove(&id);
    }

    /// Deadline expiry for `id`. No-op if the request already completed.
    pub async fn expire(&self, id: u64) {
        if let Some(sink) = self.sinks.lock().await.remove(&id) {
            warn!(request_id = id, "request deadline elapsed, abandoning sink");
            sink.fail(SinkFailure::TimedOut);
        }
    }

    /// Fail every sink that was routed through `endpoint_id`. Called when an
    /// agent is replaced, its transport dies, or a long-poll entry is
    /// reaped. Sinks routed through other endpoints are untouched.
    pub async fn fail_endpoint(&self, endpoint_id: u64) -> usize {
        let mut sinks = self.sinks.lock().await;
        let ids: Vec<u64> = sinks
            .iter()
            .filter(|(_, s)| s.endpoint_id == endpoint_id)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(sink) = sinks.remove(id) {
                sink.fail(SinkFailure::AgentGone);
            }
        }
        ids.len()
    }

    /// Apply one response frame from an agent, following the sink state
    /// machine. Request frames and unknown kinds are logged and ignored.
    pub async fn apply(&self, frame: TunnelFrame) {
        match frame.kind {
            KIND_HTTP_RES_HEAD => self.apply_head(frame.id, frame.payload).await,
            KIND_HTTP_RES_CHUNK => self.apply_chunk(frame.id, frame.payload).await,
            kind => {
                warn!(request_id = frame.id, kind, "ignoring unexpected frame kind from agent");
            }
        }
    }

    async fn apply_head(&self, id: u64, payload: Bytes) {
        let mut sinks = self.sinks.lock().await;
        let Some(sink) = sinks.get_mut(&id) else {
            warn!(request_id = id, "response head for unknown request id, dropping");
            return;
        };

        let Some(head_tx) = sink.head_tx.take() else {
            // Second head frame for the same id: protocol error, kill the sink.
            warn!(request_id = id, "duplicate response head, terminating sink");
            if let Some(sink) = sinks.remove(&id) {
                sink.fail(SinkFailure::AgentGone);
            }
            return;
        };

        match http::parse_response_head(&payload) {
            Ok(head) => {
                debug!(request_id = id, status = %head.status, "forwarding response head");
                if head_tx.send(Ok(head)).is_err() {
                    // Public side already gave up (client disconnect).
                    sinks.remove(&id);
                }
            }
            Err(e) => {
                warn!(request_id = id, error = %e, "unparseable response head, terminating sink");
                let _ = head_tx.send(Err(SinkFailure::AgentGone));
                sinks.remove(&id);
            }
        }
    }

    async fn apply_chunk(&self, id: u64, payload: Bytes) {
        let mut sinks = self.sinks.lock().await;
        if payload.is_empty() {
            // End-of-stream sentinel.
            if sinks.remove(&id).is_some() {
                debug!(request_id = id, "response stream completed");
            } else {
                warn!(request_id = id, "end-of-stream for unknown request id, dropping");
            }
            return;
        }

        let Some(sink) = sinks.get(&id) else {
            warn!(request_id = id, "body chunk for unknown request id, dropping");
            return;
        };
        if sink.head_tx.is_some() {
            warn!(request_id = id, "body chunk before response head, terminating sink");
            if let Some(sink) = sinks.remove(&id) {
                sink.fail(SinkFailure::AgentGone);
            }
            return;
        }

        // Bounded send while holding the table lock: this is the
        // backpressure point that slows an agent down to the public
        // client's drain rate.
        if sink.body_tx.send(Ok(payload)).await.is_err() {
            debug!(request_id = id, "public client went away, dropping sink");
            sinks.remove(&id);
        }
    }

    /// Number of in-flight requests.
    pub async fn len(&self) -> usize {
        self.sinks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sinks.lock().await.is_empty()
    }
}
