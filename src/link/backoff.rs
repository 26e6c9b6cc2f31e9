//! Exponential backoff between reconnect attempts

use rand::Rng;
use std::time::Duration;

use crate::config::ReconnectConfig;

/// Symmetric jitter applied around the computed delay (±10%)
const JITTER_FRACTION: f64 = 0.10;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl From<&ReconnectConfig> for BackoffPolicy {
    fn from(cfg: &ReconnectConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            multiplier: cfg.backoff_multiplier,
            jitter: cfg.jitter,
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt `n` (0-based), without jitter.
    ///
    /// `clamp(base * multiplier^n, base, max)`
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64().max(base);
        let exp = attempt.min(i32::MAX as u32) as i32;
        let raw = base * self.multiplier.powi(exp);
        let clamped = if raw.is_finite() { raw.clamp(base, max) } else { max };
        Duration::from_secs_f64(clamped)
    }

    /// Delay before attempt `n` using the thread-local RNG for jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Delay before attempt `n`, jittered with `rng` when enabled and never
    /// below the base delay.
    pub fn delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if !self.jitter {
            return nominal;
        }

        let factor = 1.0 + rng.gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        let jittered = Duration::from_secs_f64(nominal.as_secs_f64() * factor);
        jittered.max(self.base_delay)
    }
}
