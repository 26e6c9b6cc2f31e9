//! Time-windowed landmark batching
//!
//! Samples are appended to the open batch while recording. Every window the
//! batch is swapped out for an empty one under the state lock, so a sample
//! lands in exactly one batch and a batch is never split. The sealed batch is
//! then either rejected by the motion gate (raising the cooldown flag) or sent
//! as a single `landmarks_sequence` message.

use parking_lot::Mutex;
use serde::Serialize;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::motion::{MotionInspector, MotionVerdict};
use super::LandmarkSample;
use crate::config::LandmarkConfig;
use crate::link::{AbortOnDrop, ConnectionRegistry, LinkId, WireMessage};
use crate::protocol::OutboundMessage;

#[derive(Error, Debug)]
pub enum BatcherError {
    #[error("unknown link {0}")]
    UnknownLink(LinkId),

    #[error("batcher is already recording")]
    AlreadyRecording,

    #[error("window duration must be greater than zero")]
    ZeroWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatcherStatus {
    /// Cooldown raised (`true`) or cleared (`false`)
    Cooldown(bool),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatcherStats {
    pub batches_sent: u64,
    pub batches_discarded: u64,
    pub send_failures: u64,
    pub samples_sent: u64,
    pub samples_ignored: u64,
    pub cooldown: bool,
}

/// What happened to one sealed window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushOutcome {
    NotRecording,
    Empty,
    Sent { samples: usize },
    Discarded { samples: usize },
    Dropped { samples: usize },
}

/// Samples collected during one window
#[derive(Debug)]
struct LandmarkBatch {
    samples: Vec<LandmarkSample>,
    window_start_ms: u64,
}

impl LandmarkBatch {
    fn open() -> Self {
        let window_start_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            samples: Vec::new(),
            window_start_ms,
        }
    }
}

struct BatcherState {
    recording: bool,
    link_id: Option<LinkId>,
    batch: LandmarkBatch,
    cooldown: bool,
}

#[derive(Default)]
struct Counters {
    batches_sent: AtomicU64,
    batches_discarded: AtomicU64,
    send_failures: AtomicU64,
    samples_sent: AtomicU64,
    samples_ignored: AtomicU64,
}

struct Inner {
    registry: Arc<ConnectionRegistry>,
    inspector: MotionInspector,
    state: Mutex<BatcherState>,
    counters: Counters,
    status_tx: broadcast::Sender<BatcherStatus>,
}

pub struct SampleBatcher {
    inner: Arc<Inner>,
    window: Duration,
    task: Mutex<Option<AbortOnDrop>>,
}

impl SampleBatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, config: &LandmarkConfig) -> Self {
        Self::with_inspector(
            registry,
            Duration::from_millis(config.window_duration_ms),
            MotionInspector::from(config),
        )
    }

    pub fn with_inspector(
        registry: Arc<ConnectionRegistry>,
        window: Duration,
        inspector: MotionInspector,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                registry,
                inspector,
                state: Mutex::new(BatcherState {
                    recording: false,
                    link_id: None,
                    batch: LandmarkBatch::open(),
                    cooldown: false,
                }),
                counters: Counters::default(),
                status_tx,
            }),
            window,
            task: Mutex::new(None),
        }
    }

    /// Assert the recording flag and start the window timer
    pub fn start(&self, link_id: LinkId) -> Result<(), BatcherError> {
        if self.window.is_zero() {
            return Err(BatcherError::ZeroWindow);
        }
        if !self.inner.registry.contains(link_id) {
            return Err(BatcherError::UnknownLink(link_id));
        }

        let mut task = self.task.lock();
        if task.is_some() {
            return Err(BatcherError::AlreadyRecording);
        }

        {
            let mut state = self.inner.state.lock();
            state.recording = true;
            state.link_id = Some(link_id);
            state.batch = LandmarkBatch::open();
        }

        let inner = Arc::clone(&self.inner);
        let window = self.window;
        *task = Some(AbortOnDrop::new(
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + window, window);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    inner.flush_window();
                }
            }),
            "landmark-window",
        ));

        info!(link_id = %link_id, window_ms = window.as_millis() as u64, "Landmark recording started");
        Ok(())
    }

    /// Clear the recording flag, cancel the window timer and discard the open
    /// batch. Calling it again is a no-op.
    pub fn stop(&self) {
        let Some(mut task) = self.task.lock().take() else {
            return;
        };
        // Cleared first so a flush running on another worker thread cannot send
        let discarded = {
            let mut state = self.inner.state.lock();
            state.recording = false;
            mem::replace(&mut state.batch, LandmarkBatch::open()).samples.len()
        };
        task.abort();

        info!(discarded_samples = discarded, "Landmark recording stopped");
    }

    /// Retarget subsequent windows at another link
    pub fn set_link(&self, link_id: LinkId) {
        self.inner.state.lock().link_id = Some(link_id);
    }

    pub fn is_recording(&self) -> bool {
        self.inner.state.lock().recording
    }

    pub fn cooldown(&self) -> bool {
        self.inner.state.lock().cooldown
    }

    /// Offer one sample. Ignored (returns false) while not recording.
    pub fn push(&self, sample: LandmarkSample) -> bool {
        let mut state = self.inner.state.lock();
        if !state.recording {
            self.inner.counters.samples_ignored.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        state.batch.samples.push(sample);
        true
    }

    /// Samples in the currently open window
    pub fn pending(&self) -> usize {
        self.inner.state.lock().batch.samples.len()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<BatcherStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn stats(&self) -> BatcherStats {
        let c = &self.inner.counters;
        BatcherStats {
            batches_sent: c.batches_sent.load(Ordering::Relaxed),
            batches_discarded: c.batches_discarded.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
            samples_sent: c.samples_sent.load(Ordering::Relaxed),
            samples_ignored: c.samples_ignored.load(Ordering::Relaxed),
            cooldown: self.cooldown(),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            sent = stats.batches_sent,
            discarded = stats.batches_discarded,
            send_failures = stats.send_failures,
            samples = stats.samples_sent,
            cooldown = stats.cooldown,
            "Landmark batching stats"
        );
    }

    /// Seal the current window immediately
    pub(crate) fn flush_now(&self) -> FlushOutcome {
        self.inner.flush_window()
    }
}

impl Drop for SampleBatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn flush_window(&self) -> FlushOutcome {
        let (batch, link_id) = {
            let mut state = self.state.lock();
            if !state.recording {
                return FlushOutcome::NotRecording;
            }
            (mem::replace(&mut state.batch, LandmarkBatch::open()), state.link_id)
        };

        let samples = batch.samples.len();
        if samples == 0 {
            return FlushOutcome::Empty;
        }

        let verdict = self.inspector.inspect(&batch.samples);
        if let MotionVerdict::TooFast { displacement } = verdict {
            self.counters.batches_discarded.fetch_add(1, Ordering::Relaxed);
            self.set_cooldown(true);
            debug!(samples, displacement, "Window rejected, motion too fast");
            return FlushOutcome::Discarded { samples };
        }
        self.set_cooldown(false);

        let Some(link_id) = link_id else {
            self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
            return FlushOutcome::Dropped { samples };
        };

        let text = match OutboundMessage::landmarks(batch.samples, batch.window_start_ms).to_json() {
            Ok(text) => text,
            Err(e) => {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, samples, "Failed to encode landmark batch");
                return FlushOutcome::Dropped { samples };
            }
        };

        let Some(sent) = self.deliver(text, link_id) else {
            return FlushOutcome::NotRecording;
        };
        if sent {
            self.counters.batches_sent.fetch_add(1, Ordering::Relaxed);
            self.counters.samples_sent.fetch_add(samples as u64, Ordering::Relaxed);
            debug!(link_id = %link_id, samples, "Landmark batch sent");
            FlushOutcome::Sent { samples }
        } else {
            self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
            debug!(link_id = %link_id, samples, "Landmark batch dropped, link not ready");
            FlushOutcome::Dropped { samples }
        }
    }

    /// Send under the state lock; `None` once recording has stopped
    fn deliver(&self, text: String, link_id: LinkId) -> Option<bool> {
        let state = self.state.lock();
        if !state.recording {
            return None;
        }
        Some(self.registry.send(WireMessage::Text(text), link_id))
    }

    fn set_cooldown(&self, value: bool) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.cooldown != value;
            state.cooldown = value;
            changed
        };

        if changed {
            if value {
                info!("Motion too fast, cooldown raised");
            } else {
                info!("Motion back within limits, cooldown cleared");
            }
            let _ = self.status_tx.send(BatcherStatus::Cooldown(value));
        }
    }
}
