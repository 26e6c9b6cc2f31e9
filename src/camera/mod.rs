//! Frame sources
//!
//! The streamer pulls the current frame on demand; it never buffers frames.
//! `TestPatternSource` is a synthetic source for the binary's demo mode and
//! the test suite.

use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    Unavailable(String),

    #[error("frame read failed: {0}")]
    Read(String),
}

/// A handle exposing the current visual frame
pub trait FrameSource: Send + Sync + 'static {
    fn is_available(&self) -> bool;

    /// The frame currently on display, in RGB
    fn current_frame(&self) -> Result<RgbImage, CaptureError>;
}

/// Moving gradient with a sweeping bar
pub struct TestPatternSource {
    width: u32,
    height: u32,
    frame_count: AtomicU64,
    available: AtomicBool,
    failing: AtomicBool,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame_count: AtomicU64::new(0),
            available: AtomicBool::new(true),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// While set, every read fails
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Frames handed out so far
    pub fn frames_read(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }
}

impl FrameSource for TestPatternSource {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn current_frame(&self) -> Result<RgbImage, CaptureError> {
        if !self.is_available() {
            return Err(CaptureError::Unavailable("test pattern disabled".into()));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(CaptureError::Read("injected failure".into()));
        }

        let n = self.frame_count.fetch_add(1, Ordering::Relaxed);
        let (w, h) = (self.width.max(1), self.height.max(1));
        let bar = (n.wrapping_mul(4) % w as u64) as u32;

        Ok(RgbImage::from_fn(self.width, self.height, |x, y| {
            if x.abs_diff(bar) < 4 {
                Rgb([255, 255, 255])
            } else {
                Rgb([
                    (x * 255 / w) as u8,
                    (y * 255 / h) as u8,
                    (n % 256) as u8,
                ])
            }
        }))
    }
}
