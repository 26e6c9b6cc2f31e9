//! In-process loopback transport
//!
//! `MemoryConnector` hands out transports whose far end is a [`MemoryPeer`]
//! held by the caller. It backs the test suite and the binary's `--loopback`
//! mode: peers record what the client sent, can push inbound messages, and can
//! be disconnected to simulate a dropped link.
//!
//! `MemoryConnector::new` records everything, which is what tests want.
//! `MemoryConnector::bounded` keeps only a tail of messages and peers, for
//! long-running loopback sessions.

use futures::future::{self, BoxFuture};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::transport::{Connector, Transport, WireMessage};
use super::LinkError;

pub const MEMORY_SCHEME: &str = "mem://";

/// Peers kept by a bounded connector
const RETAINED_PEERS: usize = 4;

struct PeerShared {
    url: String,
    open: AtomicBool,
    history: Option<usize>,
    total: AtomicU64,
    received: Mutex<VecDeque<(Instant, WireMessage)>>,
}

impl PeerShared {
    fn record(&self, msg: WireMessage) {
        self.total.fetch_add(1, Ordering::SeqCst);
        let mut received = self.received.lock();
        received.push_back((Instant::now(), msg));
        if let Some(limit) = self.history {
            while received.len() > limit {
                received.pop_front();
            }
        }
    }
}

/// The backend side of one in-memory connection
pub struct MemoryPeer {
    shared: Arc<PeerShared>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<WireMessage>>>,
}

impl MemoryPeer {
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Recorded messages the client sent, in arrival order
    pub fn received(&self) -> Vec<WireMessage> {
        self.shared.received.lock().iter().map(|(_, m)| m.clone()).collect()
    }

    /// Arrival instants of everything the client sent
    pub fn arrival_times(&self) -> Vec<Instant> {
        self.shared.received.lock().iter().map(|(t, _)| *t).collect()
    }

    /// Messages received over the connection's lifetime, recorded or not
    pub fn received_count(&self) -> usize {
        self.shared.total.load(Ordering::SeqCst) as usize
    }

    pub fn received_binary(&self) -> Vec<bytes::Bytes> {
        self.shared
            .received
            .lock()
            .iter()
            .filter_map(|(_, m)| match m {
                WireMessage::Binary(b) => Some(b.clone()),
                WireMessage::Text(_) => None,
            })
            .collect()
    }

    pub fn received_text(&self) -> Vec<String> {
        self.shared
            .received
            .lock()
            .iter()
            .filter_map(|(_, m)| match m {
                WireMessage::Text(t) => Some(t.clone()),
                WireMessage::Binary(_) => None,
            })
            .collect()
    }

    /// Deliver a message to the client. Returns false once disconnected.
    pub fn push(&self, msg: WireMessage) -> bool {
        match self.inbound_tx.lock().as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.push(WireMessage::Text(text.into()))
    }

    /// Drop the connection from the backend side
    pub fn disconnect(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        self.inbound_tx.lock().take();
    }
}

#[derive(Default)]
struct ConnectorState {
    accepted: VecDeque<Arc<MemoryPeer>>,
    all: Vec<Arc<MemoryPeer>>,
}

/// Connector producing in-memory transports
pub struct MemoryConnector {
    history: Option<usize>,
    accepting: AtomicBool,
    attempts: AtomicU64,
    state: Mutex<ConnectorState>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::with_history(None)
    }

    /// Keep the last `history` messages per peer and the most recent peers
    pub fn bounded(history: usize) -> Self {
        Self::with_history(Some(history))
    }

    fn with_history(history: Option<usize>) -> Self {
        Self {
            history,
            accepting: AtomicBool::new(true),
            attempts: AtomicU64::new(0),
            state: Mutex::new(ConnectorState::default()),
        }
    }

    /// When false, every handshake fails until re-enabled
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Number of handshakes attempted so far
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Oldest accepted connection not yet taken
    pub fn next_peer(&self) -> Option<Arc<MemoryPeer>> {
        self.state.lock().accepted.pop_front()
    }

    /// Accepted connections; only the most recent when bounded
    pub fn peers(&self) -> Vec<Arc<MemoryPeer>> {
        self.state.lock().all.clone()
    }

    fn accept(&self, url: &str) -> Transport {
        let shared = Arc::new(PeerShared {
            url: url.to_owned(),
            open: AtomicBool::new(true),
            history: self.history,
            total: AtomicU64::new(0),
            received: Mutex::new(VecDeque::new()),
        });
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let peer = Arc::new(MemoryPeer {
            shared: Arc::clone(&shared),
            inbound_tx: Mutex::new(Some(inbound_tx)),
        });
        {
            let mut state = self.state.lock();
            state.accepted.push_back(Arc::clone(&peer));
            state.all.push(peer);
            if self.history.is_some() {
                while state.accepted.len() > RETAINED_PEERS {
                    state.accepted.pop_front();
                }
                let excess = state.all.len().saturating_sub(RETAINED_PEERS);
                state.all.drain(..excess);
            }
        }

        let sink = futures::sink::unfold(shared, |shared, msg: WireMessage| async move {
            if !shared.open.load(Ordering::SeqCst) {
                return Err(LinkError::Closed);
            }
            shared.record(msg);
            Ok(shared)
        });

        let stream = futures::stream::unfold(inbound_rx, |mut rx| async move {
            rx.recv().await.map(|msg| (Ok(msg), rx))
        });

        Transport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl Connector for MemoryConnector {
    fn accepts(&self, url: &str) -> bool {
        url.starts_with(MEMORY_SCHEME)
    }

    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport, LinkError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let result = if self.accepting.load(Ordering::SeqCst) {
            Ok(self.accept(url))
        } else {
            Err(LinkError::Handshake {
                url: url.to_owned(),
                reason: "connection refused".into(),
            })
        };
        future::ready(result).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};

    #[tokio::test]
    async fn test_loopback_both_directions() {
        let connector = MemoryConnector::new();
        let mut transport = connector.connect("mem://backend").await.unwrap();
        let peer = connector.next_peer().unwrap();

        transport.sink.send(WireMessage::Text("hello".into())).await.unwrap();
        assert_eq!(peer.received_text(), vec!["hello".to_string()]);

        assert!(peer.push_text("reply"));
        let msg = transport.stream.next().await.unwrap().unwrap();
        assert_eq!(msg, WireMessage::Text("reply".into()));
    }

    #[tokio::test]
    async fn test_disconnect_ends_stream_and_fails_sink() {
        let connector = MemoryConnector::new();
        let mut transport = connector.connect("mem://backend").await.unwrap();
        let peer = connector.next_peer().unwrap();

        peer.disconnect();
        assert!(transport.stream.next().await.is_none());
        assert!(transport.sink.send(WireMessage::Text("late".into())).await.is_err());
        assert!(!peer.push_text("nobody listening"));
    }

    #[tokio::test]
    async fn test_bounded_connector_keeps_a_tail() {
        let connector = MemoryConnector::bounded(3);
        let mut transport = connector.connect("mem://backend").await.unwrap();
        let peer = connector.next_peer().unwrap();

        for i in 0..10 {
            transport.sink.send(WireMessage::Text(i.to_string())).await.unwrap();
        }
        assert_eq!(peer.received_count(), 10);
        assert_eq!(peer.received_text(), vec!["7", "8", "9"]);

        for _ in 0..10 {
            connector.connect("mem://backend").await.unwrap();
        }
        assert_eq!(connector.peers().len(), RETAINED_PEERS);
        assert_eq!(connector.attempts(), 11);
    }

    #[tokio::test]
    async fn test_unbounded_connector_records_everything() {
        let connector = MemoryConnector::new();
        let mut transport = connector.connect("mem://backend").await.unwrap();
        let peer = connector.next_peer().unwrap();

        for i in 0..100 {
            transport.sink.send(WireMessage::Binary(vec![i as u8].into())).await.unwrap();
        }
        assert_eq!(peer.received_binary().len(), 100);
        assert_eq!(peer.arrival_times().len(), 100);
    }

    #[tokio::test]
    async fn test_refusing_connector() {
        let connector = MemoryConnector::new();
        connector.set_accepting(false);
        assert!(connector.connect("mem://backend").await.is_err());
        assert_eq!(connector.attempts(), 1);
        assert!(connector.next_peer().is_none());
    }
}
