//! Streaming statistics

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::info;

/// Why a frame never reached the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    Capture,
    Encode,
    Send,
}

/// Point-in-time view of streaming statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Reciprocal of the latest interval between two successful sends
    pub actual_fps: f64,

    /// Latest frame size over the interval since the previous successful send
    pub bytes_per_second: f64,

    /// Total bytes successfully queued on the link
    pub total_bytes_sent: u64,

    /// Total frames successfully queued on the link
    pub frames_sent: u64,

    /// Frames lost to any failure
    pub frame_drop_count: u64,

    pub capture_failures: u64,
    pub encode_failures: u64,
    pub send_failures: u64,
}

impl StatsSnapshot {
    /// Dropped frames over all attempted frames
    pub fn drop_rate(&self) -> f64 {
        let total = self.frames_sent + self.frame_drop_count;
        if total == 0 {
            return 0.0;
        }

        self.frame_drop_count as f64 / total as f64
    }
}

#[derive(Debug, Default)]
struct Inner {
    snapshot: StatsSnapshot,
    last_send: Option<Instant>,
}

/// Shared statistics for one session. Writers are the streaming tasks,
/// everyone else reads snapshots.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    inner: Mutex<Inner>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A frame of `bytes` was accepted by the link at `at`
    pub fn record_sent(&self, bytes: usize, at: Instant) {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.last_send {
            let elapsed = at.saturating_duration_since(previous).as_secs_f64();
            if elapsed > 0.0 {
                inner.snapshot.actual_fps = 1.0 / elapsed;
                inner.snapshot.bytes_per_second = bytes as f64 / elapsed;
            }
        }
        inner.last_send = Some(at);
        inner.snapshot.frames_sent += 1;
        inner.snapshot.total_bytes_sent += bytes as u64;
    }

    pub fn record_drop(&self, cause: DropCause) {
        let mut inner = self.inner.lock();
        let snapshot = &mut inner.snapshot;
        snapshot.frame_drop_count += 1;
        match cause {
            DropCause::Capture => snapshot.capture_failures += 1,
            DropCause::Encode => snapshot.encode_failures += 1,
            DropCause::Send => snapshot.send_failures += 1,
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.lock().snapshot.clone()
    }

    /// Forget the previous send so the next rate sample starts fresh
    pub fn reset_interval(&self) {
        self.inner.lock().last_send = None;
    }

    pub fn log_stats(&self) {
        let stats = self.snapshot();
        info!(
            fps = format_args!("{:.1}", stats.actual_fps),
            kbps = format_args!("{:.1}", stats.bytes_per_second * 8.0 / 1000.0),
            frames = stats.frames_sent,
            dropped = stats.frame_drop_count,
            drop_rate = format_args!("{:.3}", stats.drop_rate()),
            "Streaming stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_drop_rate() {
        let stats = StatsSnapshot {
            frames_sent: 90,
            frame_drop_count: 10,
            ..Default::default()
        };

        assert_eq!(stats.drop_rate(), 0.1);
    }

    #[test]
    fn test_rates_follow_send_interval() {
        let stats = StatsAggregator::new();
        let t0 = Instant::now();

        stats.record_sent(1000, t0);
        let first = stats.snapshot();
        assert_eq!(first.frames_sent, 1);
        assert_eq!(first.actual_fps, 0.0);

        stats.record_sent(5000, t0 + Duration::from_millis(100));
        let second = stats.snapshot();
        assert!((second.actual_fps - 10.0).abs() < 1e-9);
        assert!((second.bytes_per_second - 50_000.0).abs() < 1e-6);
        assert_eq!(second.total_bytes_sent, 6000);
    }

    #[test]
    fn test_drop_touches_only_drop_counters() {
        let stats = StatsAggregator::new();
        let t0 = Instant::now();
        stats.record_sent(1000, t0);
        stats.record_sent(1000, t0 + Duration::from_millis(50));
        let before = stats.snapshot();

        stats.record_drop(DropCause::Send);
        let after = stats.snapshot();

        assert_eq!(after.frame_drop_count, before.frame_drop_count + 1);
        assert_eq!(after.send_failures, 1);
        assert_eq!(
            StatsSnapshot {
                frame_drop_count: before.frame_drop_count,
                send_failures: before.send_failures,
                ..after
            },
            before
        );
    }
}
