//! Backend links: registry, transports and reconnection
//!
//! A link is one long-lived connection to a classification backend. The
//! [`ConnectionRegistry`] owns every link, the [`ReconnectSupervisor`] watches
//! their state and repairs dropped ones with exponential backoff.

pub mod backoff;
pub mod guards;
pub mod memory;
pub mod registry;
pub mod supervisor;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use guards::{AbortOnDrop, Subscription};
pub use memory::{MemoryConnector, MemoryPeer};
pub use registry::{ConnectionRegistry, InboundMessage, InboundPayload, RegistryConfig};
pub use supervisor::{ReconnectSupervisor, SupervisorStatus};
pub use transport::{Connector, Transport, WebSocketConnector, WireMessage};

use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("invalid link url '{0}': expected ws:// or wss://")]
    InvalidUrl(String),

    #[error("handshake with {url} failed: {reason}")]
    Handshake { url: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport closed by peer")]
    Closed,

    #[error("{link_id} gave up after {attempts} reconnect attempts")]
    Exhausted { link_id: LinkId, attempts: u32 },
}

/// Stable identifier of a link, unique for the lifetime of its registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl LinkState {
    /// Edges a link may take. Closing is allowed from anywhere.
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connected, Reconnecting)
                | (Connected, Error)
                | (Error, Reconnecting)
                | (Reconnecting, Connecting)
                | (_, Disconnected)
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Reconnecting => "reconnecting",
            LinkState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
    pub auto_reconnect: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self { auto_reconnect: true }
    }
}

/// Snapshot of one link as held by the registry
#[derive(Debug, Clone)]
pub struct Link {
    pub id: LinkId,
    pub url: String,
    pub state: LinkState,
    pub retry_count: u32,
    pub next_retry_at: Option<Instant>,
    pub auto_reconnect: bool,
}

impl Link {
    pub(crate) fn new(id: LinkId, url: String, options: LinkOptions) -> Self {
        Self {
            id,
            url,
            state: LinkState::Disconnected,
            retry_count: 0,
            next_retry_at: None,
            auto_reconnect: options.auto_reconnect,
        }
    }

    /// Applies a state change, keeping `retry_count` in step.
    ///
    /// Returns false (and leaves the link untouched) for an illegal edge.
    pub(crate) fn transition(&mut self, next: LinkState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        match (self.state, next) {
            (_, LinkState::Connected) => {
                self.retry_count = 0;
                self.next_retry_at = None;
            }
            (LinkState::Connecting, LinkState::Error) => self.retry_count += 1,
            (_, LinkState::Connecting) => self.next_retry_at = None,
            _ => {}
        }
        self.state = next;
        true
    }
}

/// Published on every link state transition
#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub link_id: LinkId,
    pub previous: LinkState,
    pub current: LinkState,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> Link {
        Link::new(LinkId(1), "ws://backend".into(), LinkOptions::default())
    }

    #[test]
    fn test_retry_count_increments_only_on_failed_connect() {
        let mut l = link();
        assert!(l.transition(LinkState::Connecting));
        assert!(l.transition(LinkState::Error));
        assert_eq!(l.retry_count, 1);

        assert!(l.transition(LinkState::Reconnecting));
        assert!(l.transition(LinkState::Connecting));
        assert!(l.transition(LinkState::Error));
        assert_eq!(l.retry_count, 2);

        assert!(l.transition(LinkState::Reconnecting));
        assert!(l.transition(LinkState::Connecting));
        assert!(l.transition(LinkState::Connected));
        assert_eq!(l.retry_count, 0);

        // A drop of an established link is not a failed attempt
        assert!(l.transition(LinkState::Error));
        assert_eq!(l.retry_count, 0);
    }

    #[test]
    fn test_illegal_edges_are_refused() {
        let mut l = link();
        assert!(!l.transition(LinkState::Connected));
        assert!(!l.transition(LinkState::Reconnecting));
        assert_eq!(l.state, LinkState::Disconnected);

        l.transition(LinkState::Connecting);
        assert!(!l.transition(LinkState::Reconnecting));
        assert!(l.transition(LinkState::Disconnected));
    }

    #[test]
    fn test_link_id_display() {
        assert_eq!(LinkId(7).to_string(), "link-7");
    }
}
