//! Motion-rate gate for landmark windows
//!
//! A window whose landmarks move too far between consecutive samples is
//! rejected: the classifier cannot follow it and the user is asked to slow
//! down. The metric is the average inter-sample displacement:
//!
//! - per pair of consecutive samples, the mean Euclidean distance over every
//!   landmark present at the same index in both (pose, left hand, right hand)
//! - per window, the mean over all pairs that share at least one landmark
//!
//! The threshold is in normalized image units per sample and should be
//! calibrated against real capture data.

use super::LandmarkSample;
use crate::config::LandmarkConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionVerdict {
    /// Too few comparable samples to judge
    Insufficient,
    Acceptable { displacement: f32 },
    TooFast { displacement: f32 },
}

impl MotionVerdict {
    pub fn is_too_fast(&self) -> bool {
        matches!(self, MotionVerdict::TooFast { .. })
    }
}

#[derive(Debug, Clone)]
pub struct MotionInspector {
    pub threshold: f32,
    pub min_samples: usize,
}

impl Default for MotionInspector {
    fn default() -> Self {
        Self {
            threshold: 0.08,
            min_samples: 2,
        }
    }
}

impl From<&LandmarkConfig> for MotionInspector {
    fn from(cfg: &LandmarkConfig) -> Self {
        Self {
            threshold: cfg.motion_threshold,
            min_samples: cfg.min_samples,
        }
    }
}

impl MotionInspector {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            ..Default::default()
        }
    }

    pub fn inspect(&self, samples: &[LandmarkSample]) -> MotionVerdict {
        if samples.len() < self.min_samples.max(2) {
            return MotionVerdict::Insufficient;
        }

        let pair_means: Vec<f32> = samples
            .windows(2)
            .filter_map(|pair| pair_displacement(&pair[0], &pair[1]))
            .collect();

        if pair_means.is_empty() {
            return MotionVerdict::Insufficient;
        }

        let displacement = pair_means.iter().sum::<f32>() / pair_means.len() as f32;
        if displacement > self.threshold {
            MotionVerdict::TooFast { displacement }
        } else {
            MotionVerdict::Acceptable { displacement }
        }
    }
}

/// Mean displacement between two samples, `None` when they share no landmark
fn pair_displacement(a: &LandmarkSample, b: &LandmarkSample) -> Option<f32> {
    let mut total = 0.0f32;
    let mut count = 0usize;

    let (sets_a, sets_b) = (a.sets(), b.sets());
    for (set_a, set_b) in sets_a.iter().zip(sets_b.iter()) {
        for (la, lb) in set_a.iter().zip(set_b.iter()) {
            total += la.distance(lb);
            count += 1;
        }
    }

    (count > 0).then(|| total / count as f32)
}
