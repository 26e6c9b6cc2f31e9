//! Capture pacing
//!
//! Two gates decide whether a tick may capture:
//!
//! 1. interval: at least `1000 / fps` ms (minus a small tolerance for tick
//!    jitter) since the previous capture
//! 2. ceiling: fewer than `fps` captures within the trailing second
//!
//! The tolerance alone would let a jittery tick source squeeze an extra frame
//! into some one-second window; the ceiling makes the rate a hard limit.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_TOLERANCE: Duration = Duration::from_millis(4);

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct FramePacer {
    fps: u32,
    min_gap: Duration,
    last_capture: Option<Instant>,
    recent: VecDeque<Instant>,
}

impl FramePacer {
    pub fn new(fps: u32) -> Self {
        Self::with_tolerance(fps, DEFAULT_TOLERANCE)
    }

    pub fn with_tolerance(fps: u32, tolerance: Duration) -> Self {
        let fps = fps.max(1);
        let interval = Duration::from_secs_f64(1.0 / fps as f64);
        Self {
            fps,
            min_gap: interval.saturating_sub(tolerance),
            last_capture: None,
            recent: VecDeque::with_capacity(fps as usize + 1),
        }
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Claim a capture slot at `now`. Returns false when the tick must be
    /// skipped; it is simply re-evaluated on the next tick.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_capture {
            if now.saturating_duration_since(last) < self.min_gap {
                return false;
            }
        }

        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) >= WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if self.recent.len() >= self.fps as usize {
            return false;
        }

        self.last_capture = Some(now);
        self.recent.push_back(now);
        true
    }
}
