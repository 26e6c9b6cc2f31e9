//! Resilient video and landmark streaming to remote classification backends
//!
//! This library keeps a set of long-lived backend links alive and multiplexes
//! two producers onto them:
//! - an adaptive-rate JPEG frame stream, paced to a per-second frame budget
//! - time-windowed landmark batches, gated on motion rate
//!
//! Dropped links are repaired by a supervisor with exponential backoff.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use landmark_streamer::camera::TestPatternSource;
//! use landmark_streamer::config::Config;
//! use landmark_streamer::link::WebSocketConnector;
//! use landmark_streamer::StreamingSession;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let session = StreamingSession::new(
//!     Config::default(),
//!     Arc::new(WebSocketConnector),
//!     Arc::new(TestPatternSource::new(640, 480)),
//! );
//! session.start();
//! let link = session.open("ws://127.0.0.1:8765/ws")?;
//! session.streamer().start(link)?;
//! # Ok(())
//! # }
//! ```

pub mod camera;
pub mod config;
pub mod landmarks;
pub mod link;
pub mod protocol;
pub mod session;
pub mod streaming;

// Re-exports for convenience
pub use camera::{CaptureError, FrameSource, TestPatternSource};
pub use config::{Config, ConfigError};
pub use landmarks::{Landmark, LandmarkSample, SampleBatcher};
pub use link::{
    ConnectionRegistry, Link, LinkError, LinkEvent, LinkId, LinkState, ReconnectSupervisor,
};
pub use protocol::{BackendMessage, OutboundMessage, SignalingMessage};
pub use session::StreamingSession;
pub use streaming::{FrameBudget, FrameStreamer, StatsSnapshot, StreamError, StreamStatus};
