//! Landmark samples, motion gating and windowed batching

pub mod batcher;
pub mod motion;

pub use batcher::{BatcherError, BatcherStats, BatcherStatus, SampleBatcher};
pub use motion::{MotionInspector, MotionVerdict};

use serde::{Deserialize, Serialize};

/// One normalized landmark position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<f32>,
}

impl Landmark {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z, visibility: None }
    }

    pub fn distance(&self, other: &Landmark) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Pose and hand landmarks extracted for one tracked instant.
///
/// A hand that was not detected is an empty set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarkSample {
    pub timestamp_ms: u64,
    pub pose: Vec<Landmark>,
    pub left_hand: Vec<Landmark>,
    pub right_hand: Vec<Landmark>,
}

impl LandmarkSample {
    /// Landmark sets in a fixed order, for pairwise comparison
    pub fn sets(&self) -> [&[Landmark]; 3] {
        [&self.pose, &self.left_hand, &self.right_hand]
    }
}
