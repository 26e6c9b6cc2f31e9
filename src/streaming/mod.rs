//! Adaptive-rate video streaming
//!
//! A capture tick runs at display refresh rate; the [`FramePacer`] decides
//! which ticks actually capture so the configured frame rate is never
//! exceeded. Captured frames are scaled, JPEG encoded and sent to one link as
//! raw binary messages.

pub mod encoder;
pub mod frame_streamer;
pub mod pacer;
pub mod stats;

pub use encoder::{encode_frame, fit_within, jpeg_quality, EncodeError};
pub use frame_streamer::FrameStreamer;
pub use pacer::FramePacer;
pub use stats::{DropCause, StatsAggregator, StatsSnapshot};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::camera::CaptureError;
use crate::config::VideoConfig;
use crate::link::LinkId;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("stream is already running")]
    AlreadyRunning,

    #[error("unknown link {0}")]
    UnknownLink(LinkId),

    #[error("invalid frame budget: {0}")]
    InvalidBudget(String),

    #[error("frame source unavailable: {0}")]
    SourceUnavailable(#[from] CaptureError),
}

/// Named budgets offered to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPreset {
    Low,
    Balanced,
    High,
    Max,
}

/// Rate, quality and resolution bounds of video capture
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameBudget {
    pub fps: u32,
    /// Encoder quality in [0, 1]
    pub quality: f32,
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for FrameBudget {
    fn default() -> Self {
        Self {
            fps: 15,
            quality: 0.7,
            max_width: 640,
            max_height: 480,
        }
    }
}

impl From<&VideoConfig> for FrameBudget {
    fn from(cfg: &VideoConfig) -> Self {
        Self {
            fps: cfg.fps,
            quality: cfg.quality,
            max_width: cfg.max_width,
            max_height: cfg.max_height,
        }
    }
}

impl FrameBudget {
    pub fn preset(preset: BudgetPreset) -> Self {
        let (fps, quality) = match preset {
            BudgetPreset::Low => (10, 0.3),
            BudgetPreset::Balanced => (15, 0.5),
            BudgetPreset::High => (20, 0.7),
            BudgetPreset::Max => (30, 0.9),
        };
        Self {
            fps,
            quality,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.fps == 0 {
            return Err(StreamError::InvalidBudget("fps must be greater than zero".into()));
        }
        if !(0.0..=1.0).contains(&self.quality) {
            return Err(StreamError::InvalidBudget(format!(
                "quality {} outside [0, 1]",
                self.quality
            )));
        }
        if self.max_width == 0 || self.max_height == 0 {
            return Err(StreamError::InvalidBudget("dimensions must be non-zero".into()));
        }
        Ok(())
    }
}

/// Stream lifecycle and capture health, published to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    Started { link_id: LinkId },
    Stopped,
    /// First failure of a run of capture failures
    CaptureFailed(String),
    CaptureRecovered,
}
