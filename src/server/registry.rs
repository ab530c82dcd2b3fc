//! Tunnel registry: `tunnel key → active agent endpoint`.
//!
//! A key maps to at most one endpoint at a time, either the persistent
//! WebSocket transport or a long-poll entry. Registering a new endpoint for
//! an occupied key atomically replaces the old one: its close signal fires,
//! and every pending sink routed through it is failed. The registry never
//! holds both transports for one key outside that single replacement step.
//!
//! Every registration gets a fresh endpoint id from a process-wide counter,
//! which is how sinks are tied to exactly the endpoint that carried them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};

use super::pending::PendingTable;
use crate::protocol::TunnelFrame;

/// Outbound frames buffered per persistent agent (burst absorption).
pub const WRITER_QUEUE_CAPACITY: usize = 256;

/// A dispatch that cannot enqueue to a persistent writer within this long
/// treats the transport as failed.
pub const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(10);

/// Un-polled frames buffered per long-poll agent. A full outbox refuses
/// dispatch, surfacing as 503 to the public caller.
pub const OUTBOX_CAPACITY: usize = 10;

/// A long-poll entry with no register/poll/response activity for this long
/// is removed by the reaper.
pub const LONGPOLL_IDLE_THRESHOLD: Duration = Duration::from_secs(300);

/// Registration failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    EmptyKey,
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyKey => write!(f, "tunnel key cannot be empty"),
        }
    }
}

impl std::error::Error for RegisterError {}

/// Frame delivery failure, mapped to a public status by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// No live endpoint, or the endpoint's transport failed on write.
    NoTunnel,
    /// The long-poll outbox is full.
    Busy,
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoTunnel => write!(f, "no active tunnel"),
            Self::Busy => write!(f, "tunnel outbox full"),
        }
    }
}

impl std::error::Error for DispatchError {}

struct PersistentEndpoint {
    frame_tx: mpsc::Sender<Bytes>,
    /// Fired when this endpoint is replaced; the connection task selects on
    /// the receiving half and shuts down.
    closed_tx: Option<oneshot::Sender<()>>,
}

struct LongPollEndpoint {
    outbox_tx: mpsc::Sender<Bytes>,
    /// Shared with the poll endpoint; one poll request drains one frame.
    outbox_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Bytes>>>,
    last_seen: Mutex<Instant>,
    remote_addr: String,
}

enum Transport {
    Persistent(PersistentEndpoint),
    LongPoll(LongPollEndpoint),
}

struct TunnelEntry {
    endpoint_id: u64,
    transport: Transport,
}

/// Which transport kinds are currently registered for a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelKinds {
    pub has_persistent: bool,
    pub has_longpoll: bool,
}

/// A dispatch capability captured at lookup time. Holding a handle pins the
/// endpoint the request is routed through, so a concurrent replacement
/// cannot silently redirect the frame.
pub enum AgentHandle {
    Persistent {
        endpoint_id: u64,
        frame_tx: mpsc::Sender<Bytes>,
    },
    LongPoll {
        endpoint_id: u64,
        outbox_tx: mpsc::Sender<Bytes>,
    },
}

impl AgentHandle {
    pub fn endpoint_id(&self) -> u64 {
        match self {
            Self::Persistent { endpoint_id, .. } | Self::LongPoll { endpoint_id, .. } => {
                *endpoint_id
            }
        }
    }

    /// Deliver one frame to the agent this handle points at.
    pub async fn dispatch(&self, frame: &TunnelFrame) -> Result<(), DispatchError> {
        let encoded = frame.encode();
        match self {
            Self::Persistent { frame_tx, .. } => frame_tx
                .send_timeout(encoded, ENQUEUE_TIMEOUT)
                .await
                .map_err(|_| DispatchError::NoTunnel),
            Self::LongPoll { outbox_tx, .. } => {
                outbox_tx.try_send(encoded).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => DispatchError::Busy,
                    mpsc::error::TrySendError::Closed(_) => DispatchError::NoTunnel,
                })
            }
        }
    }
}

/// The registry proper. Shares the pending table so replacement and reaping
/// can fail exactly the sinks routed through the removed endpoint.
pub struct TunnelRegistry {
    next_endpoint_id: AtomicU64,
    entries: RwLock<HashMap<String, TunnelEntry>>,
    pending: Arc<PendingTable>,
}

impl TunnelRegistry {
    pub fn new(pending: Arc<PendingTable>) -> Self {
        Self {
            next_endpoint_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
            pending,
        }
    }

    fn next_endpoint_id(&self) -> u64 {
        self.next_endpoint_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Replace whatever `entry` held: fire the old close signal and fail its
    /// sinks. Must run under the write lock so replacement is atomic.
    async fn retire(&self, key: &str, mut entry: TunnelEntry) {
        match &mut entry.transport {
            Transport::Persistent(ep) => {
                if let Some(closed_tx) = ep.closed_tx.take() {
                    let _ = closed_tx.send(());
                }
            }
            Transport::LongPoll(_) => {
                // Dropping the entry drops the outbox; queued frames go with it.
            }
        }
        let failed = self.pending.fail_endpoint(entry.endpoint_id).await;
        if failed > 0 {
            info!(key, endpoint_id = entry.endpoint_id, failed, "failed pending requests of retired endpoint");
        }
    }

    /// Register a persistent (WebSocket) agent, replacing any prior entry.
    /// Returns the new endpoint id and the close-signal receiver the
    /// connection task must watch.
    pub async fn register_persistent(
        &self,
        key: &str,
        frame_tx: mpsc::Sender<Bytes>,
    ) -> Result<(u64, oneshot::Receiver<()>), RegisterError> {
        if key.is_empty() {
            return Err(RegisterError::EmptyKey);
        }
        let endpoint_id = self.next_endpoint_id();
        let (closed_tx, closed_rx) = oneshot::channel();

        let mut entries = self.entries.write().await;
        if let Some(old) = entries.remove(key) {
            warn!(key, old_endpoint = old.endpoint_id, "replacing existing tunnel registration");
            self.retire(key, old).await;
        }
        entries.insert(
            key.to_string(),
            TunnelEntry {
                endpoint_id,
                transport: Transport::Persistent(PersistentEndpoint {
                    frame_tx,
                    closed_tx: Some(closed_tx),
                }),
            },
        );
        Ok((endpoint_id, closed_rx))
    }

    /// Register a long-poll agent, replacing any prior entry.
    pub async fn register_longpoll(
        &self,
        key: &str,
        remote_addr: &str,
    ) -> Result<u64, RegisterError> {
        if key.is_empty() {
            return Err(RegisterError::EmptyKey);
        }
        let endpoint_id = self.next_endpoint_id();
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);

        let mut entries = self.entries.write().await;
        if let Some(old) = entries.remove(key) {
            warn!(key, old_endpoint = old.endpoint_id, "replacing existing tunnel registration");
            self.retire(key, old).await;
        }
        entries.insert(
            key.to_string(),
            TunnelEntry {
                endpoint_id,
                transport: Transport::LongPoll(LongPollEndpoint {
                    outbox_tx,
                    outbox_rx: Arc::new(tokio::sync::Mutex::new(outbox_rx)),
                    last_seen: Mutex::new(Instant::now()),
                    remote_addr: remote_addr.to_string(),
                }),
            },
        );
        Ok(endpoint_id)
    }

    /// Remove a persistent entry, but only if it is still the one the caller
    /// owns — a replaced connection cleaning up after itself must not evict
    /// its successor. Fails the endpoint's remaining sinks either way.
    pub async fn remove_persistent(&self, key: &str, endpoint_id: u64) {
        {
            let mut entries = self.entries.write().await;
            match entries.get(key) {
                Some(entry) if entry.endpoint_id == endpoint_id => {
                    entries.remove(key);
                    info!(key, endpoint_id, remaining = entries.len(), "tunnel deregistered");
                }
                _ => {}
            }
        }
        self.pending.fail_endpoint(endpoint_id).await;
    }

    /// Capture a dispatch handle for `key`, if any endpoint is registered.
    pub async fn lookup(&self, key: &str) -> Option<AgentHandle> {
        let entries = self.entries.read().await;
        entries.get(key).map(|entry| match &entry.transport {
            Transport::Persistent(ep) => AgentHandle::Persistent {
                endpoint_id: entry.endpoint_id,
                frame_tx: ep.frame_tx.clone(),
            },
            Transport::LongPoll(ep) => AgentHandle::LongPoll {
                endpoint_id: entry.endpoint_id,
                outbox_tx: ep.outbox_tx.clone(),
            },
        })
    }

    /// Which transports exist for `key` right now. Diagnostics only.
    pub async fn kinds(&self, key: &str) -> TunnelKinds {
        let entries = self.entries.read().await;
        match entries.get(key).map(|e| &e.transport) {
            Some(Transport::Persistent(_)) => TunnelKinds {
                has_persistent: true,
                has_longpoll: false,
            },
            Some(Transport::LongPoll(_)) => TunnelKinds {
                has_persistent: false,
                has_longpoll: true,
            },
            None => TunnelKinds::default(),
        }
    }

    /// Refresh a long-poll entry's activity timestamp. Returns false when
    /// the key has no long-poll entry.
    pub async fn touch_longpoll(&self, key: &str) -> bool {
        let entries = self.entries.read().await;
        match entries.get(key).map(|e| &e.transport) {
            Some(Transport::LongPoll(ep)) => {
                *ep.last_seen.lock().expect("last_seen lock poisoned") = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Grab the shared outbox receiver for a poll request, refreshing
    /// `last_seen`. One poll drains at most one frame.
    pub async fn poll_outbox(
        &self,
        key: &str,
    ) -> Option<Arc<tokio::sync::Mutex<mpsc::Receiver<Bytes>>>> {
        let entries = self.entries.read().await;
        match entries.get(key).map(|e| &e.transport) {
            Some(Transport::LongPoll(ep)) => {
                *ep.last_seen.lock().expect("last_seen lock poisoned") = Instant::now();
                Some(ep.outbox_rx.clone())
            }
            _ => None,
        }
    }

    /// Remove long-poll entries idle for at least `idle_threshold`, failing
    /// their sinks. Returns the reaped keys.
    pub async fn reap_longpoll(&self, idle_threshold: Duration) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<String> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter_map(|(key, entry)| match &entry.transport {
                    Transport::LongPoll(ep) => {
                        let last = *ep.last_seen.lock().expect("last_seen lock poisoned");
                        (now.duration_since(last) >= idle_threshold).then(|| key.clone())
                    }
                    Transport::Persistent(_) => None,
                })
                .collect()
        };

        let mut reaped = Vec::new();
        if !stale.is_empty() {
            let mut entries = self.entries.write().await;
            for key in stale {
                // Re-check under the write lock: the agent may have re-registered
                // or polled between the two passes.
                let still_idle = match entries.get(&key).map(|e| &e.transport) {
                    Some(Transport::LongPoll(ep)) => {
                        let last = *ep.last_seen.lock().expect("last_seen lock poisoned");
                        now.duration_since(last) >= idle_threshold
                    }
                    _ => false,
                };
                if still_idle {
                    if let Some(entry) = entries.remove(&key) {
                        if let Transport::LongPoll(ep) = &entry.transport {
                            warn!(key = %key, remote_addr = %ep.remote_addr, "reaping inactive long-poll tunnel");
                        }
                        self.retire(&key, entry).await;
                        reaped.push(key);
                    }
                }
            }
        }
        reaped
    }

    /// Number of registered tunnels.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::KIND_HTTP_REQ;

    fn registry() -> (TunnelRegistry, Arc<PendingTable>) {
        let pending = Arc::new(PendingTable::new());
        (TunnelRegistry::new(pending.clone()), pending)
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected() {
        let (registry, _) = registry();
        let (tx, _rx) = mpsc::channel(1);
        assert_eq!(
            registry.register_persistent("", tx).await.unwrap_err(),
            RegisterError::EmptyKey
        );
        assert_eq!(
            registry.register_longpoll("", "1.2.3.4:5").await.unwrap_err(),
            RegisterError::EmptyKey
        );
    }

    #[tokio::test]
    async fn test_dispatch_reaches_persistent_writer() {
        let (registry, _) = registry();
        let (tx, mut rx) = mpsc::channel(WRITER_QUEUE_CAPACITY);
        registry.register_persistent("alpha", tx).await.unwrap();

        let handle = registry.lookup("alpha").await.unwrap();
        let frame = TunnelFrame::request(9, Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"));
        handle.dispatch(&frame).await.unwrap();

        let delivered = rx.recv().await.unwrap();
        let decoded = TunnelFrame::decode(delivered).unwrap();
        assert_eq!(decoded.id, 9);
        assert_eq!(decoded.kind, KIND_HTTP_REQ);
    }

    #[tokio::test]
    async fn test_lookup_unknown_key_is_none() {
        let (registry, _) = registry();
        assert!(registry.lookup("nope").await.is_none());
        assert_eq!(registry.kinds("nope").await, TunnelKinds::default());
    }

    #[tokio::test]
    async fn test_longpoll_outbox_refuses_eleventh_frame() {
        let (registry, _) = registry();
        registry.register_longpoll("gamma", "1.2.3.4:5").await.unwrap();
        let handle = registry.lookup("gamma").await.unwrap();

        let frame = TunnelFrame::request(1, Bytes::from_static(b"x"));
        for _ in 0..OUTBOX_CAPACITY {
            handle.dispatch(&frame).await.unwrap();
        }
        assert_eq!(handle.dispatch(&frame).await.unwrap_err(), DispatchError::Busy);
    }

    #[tokio::test]
    async fn test_replacement_fires_close_and_fails_old_sinks() {
        let (registry, pending) = registry();
        let (tx_a, _rx_a) = mpsc::channel(1);
        let (endpoint_a, closed_a) = registry.register_persistent("alpha", tx_a).await.unwrap();

        // One request is in flight through endpoint A.
        let id = pending.allocate_id();
        let sink = pending.register(id, endpoint_a).await;

        let (tx_b, _rx_b) = mpsc::channel(1);
        let (endpoint_b, _closed_b) = registry.register_persistent("alpha", tx_b).await.unwrap();
        assert_ne!(endpoint_a, endpoint_b);

        // The old connection task is told to shut down...
        closed_a.await.unwrap();
        // ...and the in-flight request fails.
        assert!(sink.head_rx.await.unwrap().is_err());
        assert!(pending.is_empty().await);

        // The new endpoint is the one registered.
        assert_eq!(registry.lookup("alpha").await.unwrap().endpoint_id(), endpoint_b);
    }

    #[tokio::test]
    async fn test_stale_remove_does_not_evict_successor() {
        let (registry, _) = registry();
        let (tx_a, _rx_a) = mpsc::channel(1);
        let (endpoint_a, _closed_a) = registry.register_persistent("alpha", tx_a).await.unwrap();
        let (tx_b, _rx_b) = mpsc::channel(1);
        let (endpoint_b, _closed_b) = registry.register_persistent("alpha", tx_b).await.unwrap();

        // The replaced connection's cleanup must be a no-op on the map.
        registry.remove_persistent("alpha", endpoint_a).await;
        assert_eq!(registry.lookup("alpha").await.unwrap().endpoint_id(), endpoint_b);

        registry.remove_persistent("alpha", endpoint_b).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_reap_removes_idle_longpoll_and_fails_sinks() {
        let (registry, pending) = registry();
        let endpoint = registry.register_longpoll("gamma", "1.2.3.4:5").await.unwrap();
        let id = pending.allocate_id();
        let sink = pending.register(id, endpoint).await;

        // Zero threshold: everything is idle.
        let reaped = registry.reap_longpoll(Duration::ZERO).await;
        assert_eq!(reaped, vec!["gamma".to_string()]);
        assert!(registry.is_empty().await);
        assert!(sink.head_rx.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_touch_keeps_longpoll_alive() {
        let (registry, _) = registry();
        registry.register_longpoll("gamma", "1.2.3.4:5").await.unwrap();
        assert!(registry.touch_longpoll("gamma").await);

        // A generous threshold reaps nothing that was just touched.
        let reaped = registry.reap_longpoll(Duration::from_secs(300)).await;
        assert!(reaped.is_empty());
        assert_eq!(registry.len().await, 1);
    }
}
