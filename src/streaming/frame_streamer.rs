//! Capture / encode / send loop for one link

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::encoder::encode_frame;
use super::pacer::FramePacer;
use super::stats::{DropCause, StatsAggregator, StatsSnapshot};
use super::{FrameBudget, StreamError, StreamStatus};
use crate::camera::{CaptureError, FrameSource};
use crate::link::{AbortOnDrop, ConnectionRegistry, LinkId, WireMessage};

pub const DEFAULT_REFRESH_HZ: u32 = 60;

struct ActiveStream {
    link_id: LinkId,
    live: Arc<Mutex<bool>>,
    task: AbortOnDrop,
}

/// Streams frames from a [`FrameSource`] to one link within a [`FrameBudget`]
pub struct FrameStreamer {
    registry: Arc<ConnectionRegistry>,
    source: Arc<dyn FrameSource>,
    stats: Arc<StatsAggregator>,
    refresh_hz: u32,
    budget: Mutex<FrameBudget>,
    active: Mutex<Option<ActiveStream>>,
    status_tx: broadcast::Sender<StreamStatus>,
}

impl FrameStreamer {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        source: Arc<dyn FrameSource>,
        stats: Arc<StatsAggregator>,
        budget: FrameBudget,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(32);
        Self {
            registry,
            source,
            stats,
            refresh_hz: DEFAULT_REFRESH_HZ,
            budget: Mutex::new(budget),
            active: Mutex::new(None),
            status_tx,
        }
    }

    /// Tick rate of the capture loop, normally the display refresh rate
    pub fn with_refresh_hz(mut self, refresh_hz: u32) -> Self {
        self.refresh_hz = refresh_hz.max(1);
        self
    }

    pub fn budget(&self) -> FrameBudget {
        *self.budget.lock()
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn active_link(&self) -> Option<LinkId> {
        self.active.lock().as_ref().map(|a| a.link_id)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StreamStatus> {
        self.status_tx.subscribe()
    }

    /// Replace the budget. Only allowed while stopped.
    pub fn update_budget(&self, budget: FrameBudget) -> Result<(), StreamError> {
        let active = self.active.lock();
        if active.is_some() {
            return Err(StreamError::AlreadyRunning);
        }
        budget.validate()?;
        *self.budget.lock() = budget;
        info!(fps = budget.fps, quality = budget.quality, "Frame budget updated");
        Ok(())
    }

    /// Update the budget and start in one step
    pub fn start_with(&self, link_id: LinkId, budget: FrameBudget) -> Result<(), StreamError> {
        self.update_budget(budget)?;
        self.start(link_id)
    }

    /// Start streaming to `link_id` with the current budget.
    ///
    /// The link must exist but need not be connected; frames captured while
    /// it is not are counted as send drops.
    pub fn start(&self, link_id: LinkId) -> Result<(), StreamError> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(StreamError::AlreadyRunning);
        }

        let budget = *self.budget.lock();
        budget.validate()?;
        if !self.registry.contains(link_id) {
            return Err(StreamError::UnknownLink(link_id));
        }
        if !self.source.is_available() {
            return Err(StreamError::SourceUnavailable(CaptureError::Unavailable(
                "frame source reports unavailable".into(),
            )));
        }

        self.stats.reset_interval();
        let live = Arc::new(Mutex::new(true));
        let mut worker = CaptureWorker {
            live: Arc::clone(&live),
            registry: Arc::clone(&self.registry),
            source: Arc::clone(&self.source),
            stats: Arc::clone(&self.stats),
            status_tx: self.status_tx.clone(),
            budget,
            link_id,
            pacer: FramePacer::new(budget.fps),
            capture_failing: false,
        };
        let period = Duration::from_secs_f64(1.0 / self.refresh_hz as f64);

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                let now = ticker.tick().await;
                worker.tick(now);
            }
        });

        *active = Some(ActiveStream {
            link_id,
            live,
            task: AbortOnDrop::new(task, "frame-capture"),
        });
        info!(
            link_id = %link_id,
            fps = budget.fps,
            quality = budget.quality,
            max_width = budget.max_width,
            max_height = budget.max_height,
            "Frame streaming started"
        );
        let _ = self.status_tx.send(StreamStatus::Started { link_id });
        Ok(())
    }

    /// Cancel the capture tick. Calling it again is a no-op.
    pub fn stop(&self) {
        let Some(mut stream) = self.active.lock().take() else {
            return;
        };
        // A tick already running on another worker thread sees this before it sends
        *stream.live.lock() = false;
        stream.task.abort();

        info!(link_id = %stream.link_id, "Frame streaming stopped");
        let _ = self.status_tx.send(StreamStatus::Stopped);
    }
}

impl Drop for FrameStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the capture task
struct CaptureWorker {
    /// Cleared by `stop`; held across the send
    live: Arc<Mutex<bool>>,
    registry: Arc<ConnectionRegistry>,
    source: Arc<dyn FrameSource>,
    stats: Arc<StatsAggregator>,
    status_tx: broadcast::Sender<StreamStatus>,
    budget: FrameBudget,
    link_id: LinkId,
    pacer: FramePacer,
    capture_failing: bool,
}

impl CaptureWorker {
    fn tick(&mut self, now: Instant) {
        if !self.pacer.try_acquire(now) {
            return;
        }
        self.capture_once(now);
    }

    fn capture_once(&mut self, now: Instant) {
        let frame = match self.source.current_frame() {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.record_drop(DropCause::Capture);
                if !self.capture_failing {
                    self.capture_failing = true;
                    warn!(link_id = %self.link_id, error = %e, "Frame capture failing");
                    let _ = self.status_tx.send(StreamStatus::CaptureFailed(e.to_string()));
                }
                return;
            }
        };
        if self.capture_failing {
            self.capture_failing = false;
            info!(link_id = %self.link_id, "Frame capture recovered");
            let _ = self.status_tx.send(StreamStatus::CaptureRecovered);
        }

        let jpeg = match encode_frame(&frame, &self.budget) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                self.stats.record_drop(DropCause::Encode);
                warn!(link_id = %self.link_id, error = %e, "Dropping frame, encode failed");
                return;
            }
        };

        let size = jpeg.len();
        let sent = {
            let live = self.live.lock();
            if !*live {
                return;
            }
            self.registry.send(WireMessage::Binary(jpeg), self.link_id)
        };
        if sent {
            self.stats.record_sent(size, now);
        } else {
            self.stats.record_drop(DropCause::Send);
            debug!(link_id = %self.link_id, bytes = size, "Dropping frame, link not ready");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::TestPatternSource;
    use crate::link::{LinkState, MemoryConnector, RegistryConfig};
    use assert_matches::assert_matches;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        connector: Arc<MemoryConnector>,
        source: Arc<TestPatternSource>,
        stats: Arc<StatsAggregator>,
        link_id: LinkId,
    }

    async fn fixture() -> Fixture {
        let connector = Arc::new(MemoryConnector::new());
        let registry = ConnectionRegistry::new(connector.clone(), RegistryConfig::default());
        let link_id = registry.open("mem://classifier").unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        Fixture {
            registry,
            connector,
            source: Arc::new(TestPatternSource::new(64, 48)),
            stats: Arc::new(StatsAggregator::new()),
            link_id,
        }
    }

    fn budget(fps: u32) -> FrameBudget {
        FrameBudget {
            fps,
            quality: 0.5,
            max_width: 32,
            max_height: 24,
        }
    }

    fn streamer(f: &Fixture, fps: u32) -> FrameStreamer {
        FrameStreamer::new(f.registry.clone(), f.source.clone(), f.stats.clone(), budget(fps))
    }

    fn worker(f: &Fixture, fps: u32) -> CaptureWorker {
        let (status_tx, _) = broadcast::channel(8);
        CaptureWorker {
            live: Arc::new(Mutex::new(true)),
            registry: f.registry.clone(),
            source: f.source.clone(),
            stats: f.stats.clone(),
            status_tx,
            budget: budget(fps),
            link_id: f.link_id,
            pacer: FramePacer::new(fps),
            capture_failing: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_binary_frames_at_budget_rate() {
        let f = fixture().await;
        let streamer = streamer(&f, 10);
        streamer.start(f.link_id).unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        streamer.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let peer = f.connector.next_peer().unwrap();
        let frames = peer.received_binary();
        assert!((19..=21).contains(&frames.len()), "sent {}", frames.len());
        assert!(frames.iter().all(|jpeg| jpeg[..2] == [0xFF, 0xD8]));

        let stats = streamer.stats();
        assert_eq!(stats.frames_sent as usize, frames.len());
        assert_eq!(stats.frame_drop_count, 0);
        assert!(stats.actual_fps > 8.0 && stats.actual_fps <= 10.5, "fps {}", stats.actual_fps);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_to_failed_link_counts_one_drop() {
        let f = fixture().await;
        let mut w = worker(&f, 10);

        let t0 = Instant::now();
        w.capture_once(t0);
        w.capture_once(t0 + Duration::from_millis(100));

        f.connector.next_peer().unwrap().disconnect();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(f.registry.link(f.link_id).unwrap().state, LinkState::Error);

        let before = f.stats.snapshot();
        w.capture_once(t0 + Duration::from_millis(200));
        let after = f.stats.snapshot();

        assert_eq!(after.frame_drop_count, before.frame_drop_count + 1);
        assert_eq!(after.send_failures, 1);
        assert_eq!(after.frames_sent, before.frames_sent);
        assert_eq!(after.total_bytes_sent, before.total_bytes_sent);
        assert_eq!(after.actual_fps, before.actual_fps);
        assert_eq!(after.bytes_per_second, before.bytes_per_second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_in_flight_at_stop_sends_nothing() {
        let f = fixture().await;
        let mut w = worker(&f, 10);

        let t0 = Instant::now();
        w.capture_once(t0);
        *w.live.lock() = false;
        w.capture_once(t0 + Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(f.connector.next_peer().unwrap().received_count(), 1);
        let stats = f.stats.snapshot();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.frame_drop_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_tick_is_skipped() {
        let f = fixture().await;
        let mut w = worker(&f, 10);

        let t0 = Instant::now();
        w.tick(t0);
        w.tick(t0 + Duration::from_millis(40));
        assert_eq!(f.source.frames_read(), 1);

        w.tick(t0 + Duration::from_millis(100));
        assert_eq!(f.source.frames_read(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_failures_reported_once_per_run() {
        let f = fixture().await;
        let mut w = worker(&f, 10);
        let mut status = w.status_tx.subscribe();

        let t0 = Instant::now();
        f.source.set_failing(true);
        for i in 0..3 {
            w.capture_once(t0 + Duration::from_millis(100 * i));
        }
        f.source.set_failing(false);
        w.capture_once(t0 + Duration::from_millis(300));

        assert_matches!(status.try_recv(), Ok(StreamStatus::CaptureFailed(_)));
        assert_eq!(status.try_recv(), Ok(StreamStatus::CaptureRecovered));
        assert!(status.try_recv().is_err());

        let stats = f.stats.snapshot();
        assert_eq!(stats.capture_failures, 3);
        assert_eq!(stats.frames_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_validation() {
        let f = fixture().await;
        let streamer = streamer(&f, 10);

        assert_matches!(streamer.start(LinkId(99)), Err(StreamError::UnknownLink(_)));

        f.source.set_available(false);
        assert_matches!(streamer.start(f.link_id), Err(StreamError::SourceUnavailable(_)));
        f.source.set_available(true);

        streamer.start(f.link_id).unwrap();
        assert_matches!(streamer.start(f.link_id), Err(StreamError::AlreadyRunning));
        assert_matches!(streamer.update_budget(budget(30)), Err(StreamError::AlreadyRunning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_twice_leaves_no_tick() {
        let f = fixture().await;
        let streamer = streamer(&f, 30);
        let mut status = streamer.subscribe_status();
        streamer.start(f.link_id).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        streamer.stop();
        streamer.stop();
        assert!(!streamer.is_running());

        let read = f.source.frames_read();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.source.frames_read(), read);

        assert_matches!(status.try_recv(), Ok(StreamStatus::Started { .. }));
        assert_eq!(status.try_recv(), Ok(StreamStatus::Stopped));
        assert!(status.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_budget_while_stopped() {
        let f = fixture().await;
        let streamer = streamer(&f, 10);

        streamer.update_budget(budget(20)).unwrap();
        assert_eq!(streamer.budget().fps, 20);
        assert_matches!(
            streamer.update_budget(FrameBudget { fps: 0, ..budget(10) }),
            Err(StreamError::InvalidBudget(_))
        );
        assert_eq!(streamer.budget().fps, 20);
    }
}
