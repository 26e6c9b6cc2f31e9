//! Connection registry
//!
//! The registry owns every backend link and multiplexes producers onto them.
//!
//! ```text
//!                        Arc<ConnectionRegistry>
//!                  ┌──────────────────────────────┐
//!   FrameStreamer ─┤ links: HashMap<LinkId,       │── writer task ──► transport
//!   SampleBatcher ─┤   LinkEntry { link, tx, .. } │◄─ reader task ──  transport
//!   control msgs  ─┤ >                            │
//!                  └──────┬──────────────┬────────┘
//!                         │ LinkEvent    │ InboundMessage
//!                         ▼              ▼
//!              ReconnectSupervisor     subscribers
//! ```
//!
//! Each connected link has a bounded outbound queue drained in order by its
//! writer task. `send` never waits: a full queue drops the payload and reports
//! `false`, which is the backpressure signal producers count as a drop.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::guards::{AbortOnDrop, Subscription};
use super::transport::{Connector, Transport, TransportSink, TransportStream, WireMessage};
use super::{Link, LinkError, LinkEvent, LinkId, LinkOptions, LinkState};
use crate::config::RegistrySettings;
use crate::protocol::{self, BackendMessage};

/// Registry sizing
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Per-link outbound queue depth before sends start failing
    pub outbound_capacity: usize,
    /// Buffered events per subscriber before it lags
    pub event_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
            event_capacity: 256,
        }
    }
}

impl From<&RegistrySettings> for RegistryConfig {
    fn from(settings: &RegistrySettings) -> Self {
        Self {
            outbound_capacity: settings.outbound_capacity,
            event_capacity: settings.event_capacity,
        }
    }
}

/// A message received from a backend
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub link_id: LinkId,
    pub payload: InboundPayload,
}

#[derive(Debug, Clone)]
pub enum InboundPayload {
    Json(BackendMessage),
    Binary(Bytes),
}

struct LinkEntry {
    link: Link,
    generation: u64,
    outbound: Option<mpsc::Sender<WireMessage>>,
    handshake: Option<AbortOnDrop>,
    writer: Option<AbortOnDrop>,
    reader: Option<AbortOnDrop>,
}

impl LinkEntry {
    fn new(link: Link) -> Self {
        Self {
            link,
            generation: 0,
            outbound: None,
            handshake: None,
            writer: None,
            reader: None,
        }
    }

    fn release_transport(&mut self) {
        self.outbound = None;
        self.handshake = None;
        self.writer = None;
        self.reader = None;
    }
}

/// Owns and multiplexes all backend links
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    config: RegistryConfig,
    links: Mutex<HashMap<LinkId, LinkEntry>>,
    next_id: AtomicU64,
    parse_errors: AtomicU64,
    state_tx: broadcast::Sender<LinkEvent>,
    message_tx: broadcast::Sender<InboundMessage>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>, config: RegistryConfig) -> Arc<Self> {
        let (state_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (message_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Arc::new(Self {
            connector,
            config,
            links: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            state_tx,
            message_tx,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Open a link with automatic reconnection enabled
    pub fn open(self: &Arc<Self>, url: &str) -> Result<LinkId, LinkError> {
        self.open_with(url, LinkOptions::default())
    }

    /// Create a link and start its handshake in the background.
    ///
    /// The link starts in `connecting`; the outcome arrives as a state event.
    pub fn open_with(self: &Arc<Self>, url: &str, options: LinkOptions) -> Result<LinkId, LinkError> {
        if !self.connector.accepts(url) {
            return Err(LinkError::InvalidUrl(url.to_owned()));
        }

        let id = LinkId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.links
            .lock()
            .insert(id, LinkEntry::new(Link::new(id, url.to_owned(), options)));

        info!(link_id = %id, url = %url, auto_reconnect = options.auto_reconnect, "Opening link");
        self.begin_connect(id);
        Ok(id)
    }

    /// Queue `payload` on a connected link.
    ///
    /// Returns false for unknown or non-connected links and when the link's
    /// outbound queue is full.
    pub fn send(&self, payload: WireMessage, link_id: LinkId) -> bool {
        let links = self.links.lock();
        let Some(entry) = links.get(&link_id) else {
            return false;
        };
        if entry.link.state != LinkState::Connected {
            return false;
        }
        let Some(tx) = entry.outbound.as_ref() else {
            return false;
        };

        match tx.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(link_id = %link_id, "Outbound queue full, dropping payload");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Serialize `value` as JSON text and send it
    pub fn send_json<T: Serialize>(&self, link_id: LinkId, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(text) => self.send(WireMessage::Text(text), link_id),
            Err(e) => {
                warn!(link_id = %link_id, error = %e, "Failed to serialize outbound message");
                false
            }
        }
    }

    /// Send to every connected link; returns how many accepted the payload
    pub fn broadcast(&self, payload: WireMessage) -> usize {
        let connected: Vec<LinkId> = {
            let links = self.links.lock();
            links
                .values()
                .filter(|e| e.link.state == LinkState::Connected)
                .map(|e| e.link.id)
                .collect()
        };

        connected
            .into_iter()
            .filter(|id| self.send(payload.clone(), *id))
            .count()
    }

    /// Close a link, release its transport and forget it.
    ///
    /// Subscribers (including the supervisor) see a final `disconnected`
    /// event, which cancels any pending reconnect.
    pub fn close(&self, link_id: LinkId) -> bool {
        let Some(mut entry) = self.links.lock().remove(&link_id) else {
            return false;
        };

        let previous = entry.link.state;
        entry.link.transition(LinkState::Disconnected);
        entry.release_transport();

        info!(link_id = %link_id, previous = %previous, "Link closed");
        self.publish_state(link_id, previous, LinkState::Disconnected, None);
        true
    }

    pub fn close_all(&self) -> usize {
        let ids: Vec<LinkId> = self.links.lock().keys().copied().collect();
        ids.into_iter().filter(|id| self.close(*id)).count()
    }

    pub fn contains(&self, link_id: LinkId) -> bool {
        self.links.lock().contains_key(&link_id)
    }

    pub fn link(&self, link_id: LinkId) -> Option<Link> {
        self.links.lock().get(&link_id).map(|e| e.link.clone())
    }

    /// Snapshot of all links, ordered by id
    pub fn links(&self) -> Vec<Link> {
        let mut links: Vec<Link> = self.links.lock().values().map(|e| e.link.clone()).collect();
        links.sort_by_key(|l| l.id);
        links
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    /// Inbound text messages discarded because they failed to parse
    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<LinkEvent> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.message_tx.subscribe()
    }

    /// Invoke `callback` for every state transition until the returned
    /// subscription is dropped
    pub fn on_state_change<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(LinkEvent) + Send + 'static,
    {
        let mut rx = self.subscribe_state();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "State subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription::new(handle, "state-subscription")
    }

    /// Invoke `callback` for every inbound message until the returned
    /// subscription is dropped
    pub fn on_message<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(InboundMessage) + Send + 'static,
    {
        let mut rx = self.subscribe_messages();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => callback(message),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Message subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription::new(handle, "message-subscription")
    }

    /// Move a failed link to `reconnecting` and record when the next attempt
    /// is due
    pub(crate) fn schedule_reconnect(&self, link_id: LinkId, at: Instant) -> bool {
        let mut links = self.links.lock();
        let Some(entry) = links.get_mut(&link_id) else {
            return false;
        };

        let previous = entry.link.state;
        if !entry.link.transition(LinkState::Reconnecting) {
            warn!(link_id = %link_id, state = %previous, "Refusing to schedule reconnect from this state");
            return false;
        }
        entry.link.next_retry_at = Some(at);
        self.publish_state(link_id, previous, LinkState::Reconnecting, None);
        true
    }

    /// Restart the handshake of a link waiting in `reconnecting`
    pub(crate) fn reconnect(self: &Arc<Self>, link_id: LinkId) -> bool {
        let waiting = self
            .links
            .lock()
            .get(&link_id)
            .map(|e| e.link.state == LinkState::Reconnecting)
            .unwrap_or(false);

        waiting && self.begin_connect(link_id)
    }

    fn begin_connect(self: &Arc<Self>, link_id: LinkId) -> bool {
        let (url, generation) = {
            let mut links = self.links.lock();
            let Some(entry) = links.get_mut(&link_id) else {
                return false;
            };

            let previous = entry.link.state;
            if !entry.link.transition(LinkState::Connecting) {
                warn!(link_id = %link_id, state = %previous, "Refusing to connect from this state");
                return false;
            }
            entry.generation += 1;
            self.publish_state(link_id, previous, LinkState::Connecting, None);
            (entry.link.url.clone(), entry.generation)
        };

        let handshake = self.connector.connect(&url);
        let registry = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let result = handshake.await;
            if let Some(registry) = registry.upgrade() {
                match result {
                    Ok(transport) => registry.attach(link_id, generation, transport),
                    Err(e) => registry.fail(link_id, generation, e),
                }
            }
        });

        if let Some(entry) = self.links.lock().get_mut(&link_id) {
            if entry.generation == generation {
                entry.handshake = Some(AbortOnDrop::new(handle, "link-handshake"));
            }
        }
        true
    }

    fn attach(self: &Arc<Self>, link_id: LinkId, generation: u64, transport: Transport) {
        let mut links = self.links.lock();
        let Some(entry) = links.get_mut(&link_id) else {
            debug!(link_id = %link_id, "Link closed during handshake, dropping transport");
            return;
        };
        if entry.generation != generation {
            return;
        }

        let previous = entry.link.state;
        if !entry.link.transition(LinkState::Connected) {
            return;
        }

        let (tx, rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let weak = Arc::downgrade(self);
        entry.outbound = Some(tx);
        entry.writer = Some(AbortOnDrop::new(
            tokio::spawn(write_loop(weak.clone(), link_id, generation, transport.sink, rx)),
            "link-writer",
        ));
        entry.reader = Some(AbortOnDrop::new(
            tokio::spawn(read_loop(weak, link_id, generation, transport.stream)),
            "link-reader",
        ));

        info!(link_id = %link_id, url = %entry.link.url, "Link connected");
        self.publish_state(link_id, previous, LinkState::Connected, None);
    }

    fn fail(&self, link_id: LinkId, generation: u64, error: LinkError) {
        let mut links = self.links.lock();
        let Some(entry) = links.get_mut(&link_id) else {
            return;
        };
        if entry.generation != generation {
            return;
        }

        let previous = entry.link.state;
        if !matches!(previous, LinkState::Connecting | LinkState::Connected) {
            return;
        }
        entry.link.transition(LinkState::Error);
        entry.release_transport();

        warn!(
            link_id = %link_id,
            error = %error,
            retry_count = entry.link.retry_count,
            "Link failed"
        );
        self.publish_state(link_id, previous, LinkState::Error, Some(error.to_string()));
    }

    fn dispatch_inbound(&self, link_id: LinkId, message: WireMessage) {
        let payload = match message {
            WireMessage::Binary(data) => InboundPayload::Binary(data),
            WireMessage::Text(text) => match protocol::parse_inbound(&text) {
                Ok(parsed) => InboundPayload::Json(parsed),
                Err(e) => {
                    self.parse_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(link_id = %link_id, error = %e, "Discarding malformed inbound message");
                    return;
                }
            },
        };

        // No receivers is fine: nobody is listening right now.
        let _ = self.message_tx.send(InboundMessage { link_id, payload });
    }

    fn publish_state(
        &self,
        link_id: LinkId,
        previous: LinkState,
        current: LinkState,
        reason: Option<String>,
    ) {
        let _ = self.state_tx.send(LinkEvent {
            link_id,
            previous,
            current,
            reason,
        });
    }
}

async fn write_loop(
    registry: Weak<ConnectionRegistry>,
    link_id: LinkId,
    generation: u64,
    mut sink: TransportSink,
    mut rx: mpsc::Receiver<WireMessage>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = sink.send(message).await {
            if let Some(registry) = registry.upgrade() {
                registry.fail(link_id, generation, e);
            }
            return;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    registry: Weak<ConnectionRegistry>,
    link_id: LinkId,
    generation: u64,
    mut stream: TransportStream,
) {
    while let Some(item) = stream.next().await {
        let Some(registry) = registry.upgrade() else {
            return;
        };
        match item {
            Ok(message) => registry.dispatch_inbound(link_id, message),
            Err(e) => {
                registry.fail(link_id, generation, e);
                return;
            }
        }
    }

    if let Some(registry) = registry.upgrade() {
        registry.fail(link_id, generation, LinkError::Closed);
    }
}
