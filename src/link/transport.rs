//! Link transports
//!
//! The registry never talks to sockets directly. It asks a [`Connector`] for a
//! [`Transport`] (a message sink plus an inbound stream) and drives both from
//! its own tasks. Production links use [`WebSocketConnector`].

use bytes::Bytes;
use futures::future::{self, BoxFuture};
use futures::{Sink, Stream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use super::LinkError;

/// One message on a link. Video frames travel as `Binary`, everything else as
/// JSON `Text`.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
}

impl WireMessage {
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(t) => t.len(),
            WireMessage::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<WireMessage> for Message {
    fn from(msg: WireMessage) -> Self {
        match msg {
            WireMessage::Text(text) => Message::text(text),
            WireMessage::Binary(data) => Message::binary(data),
        }
    }
}

pub type TransportSink = Pin<Box<dyn Sink<WireMessage, Error = LinkError> + Send>>;
pub type TransportStream = Pin<Box<dyn Stream<Item = Result<WireMessage, LinkError>> + Send>>;

/// An established connection, split into its outbound and inbound halves
pub struct Transport {
    pub sink: TransportSink,
    pub stream: TransportStream,
}

/// Opens transports for the registry
pub trait Connector: Send + Sync + 'static {
    /// URL schemes this connector accepts (checked before any handshake)
    fn accepts(&self, url: &str) -> bool;

    /// Perform the handshake. No timeout is applied beyond the transport's own.
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport, LinkError>>;
}

/// WebSocket transport backed by tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn accepts(&self, url: &str) -> bool {
        url.starts_with("ws://") || url.starts_with("wss://")
    }

    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport, LinkError>> {
        let url = url.to_owned();
        async move {
            let (ws_stream, _response) =
                connect_async(url.as_str())
                    .await
                    .map_err(|e| LinkError::Handshake {
                        url: url.clone(),
                        reason: e.to_string(),
                    })?;

            debug!(url = %url, "WebSocket handshake complete");

            let (ws_tx, ws_rx) = ws_stream.split();

            let sink = ws_tx
                .sink_map_err(|e| LinkError::Transport(e.to_string()))
                .with(|msg: WireMessage| future::ready(Ok::<_, LinkError>(Message::from(msg))));

            // Control frames are answered by tungstenite itself; a close frame
            // ends the stream.
            let stream = ws_rx
                .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
                .filter_map(|msg| {
                    future::ready(match msg {
                        Ok(Message::Text(text)) => Some(Ok(WireMessage::Text(text.as_str().to_owned()))),
                        Ok(Message::Binary(data)) => Some(Ok(WireMessage::Binary(data))),
                        Ok(_) => None,
                        Err(e) => Some(Err(LinkError::Transport(e.to_string()))),
                    })
                });

            Ok(Transport {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_scheme_check() {
        let connector = WebSocketConnector;
        assert!(connector.accepts("ws://127.0.0.1:8765/ws"));
        assert!(connector.accepts("wss://backend.example/predict"));
        assert!(!connector.accepts("http://backend.example"));
        assert!(!connector.accepts("mem://loopback"));
    }

    #[test]
    fn test_wire_message_len() {
        assert_eq!(WireMessage::Text("abc".into()).len(), 3);
        assert!(WireMessage::Binary(Bytes::new()).is_empty());
    }
}
