//! Configuration management for the landmark streamer

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Frame rates offered by the capture budget
pub const ALLOWED_FPS: [u32; 4] = [10, 15, 20, 30];

/// Complete streamer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Backends to open at startup
    #[serde(default)]
    pub links: Vec<LinkConfig>,

    #[serde(default)]
    pub video: VideoConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub landmarks: LandmarkConfig,

    #[serde(default)]
    pub registry: RegistrySettings,
}

/// One backend endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LinkConfig {
    /// `ws://` or `wss://` endpoint (`mem://` in loopback mode)
    pub url: String,

    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

/// Capture budget and tick rate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VideoConfig {
    /// Frames per second, one of 10, 15, 20, 30
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Encoder quality, 0.3 to 0.9
    #[serde(default = "default_quality")]
    pub quality: f32,

    #[serde(default = "default_max_width")]
    pub max_width: u32,

    #[serde(default = "default_max_height")]
    pub max_height: u32,

    /// Capture tick rate, normally the display refresh rate
    #[serde(default = "default_refresh_hz")]
    pub refresh_hz: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            quality: default_quality(),
            max_width: default_max_width(),
            max_height: default_max_height(),
            refresh_hz: default_refresh_hz(),
        }
    }
}

/// Reconnection backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReconnectConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// ±10% randomization of each delay
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Period of the safety-net scan over all links
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
            monitor_interval_ms: default_monitor_interval_ms(),
        }
    }
}

/// Landmark batching and motion gating
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LandmarkConfig {
    #[serde(default = "default_window_duration_ms")]
    pub window_duration_ms: u64,

    /// Mean inter-sample displacement above which a window is rejected
    #[serde(default = "default_motion_threshold")]
    pub motion_threshold: f32,

    /// Windows with fewer samples are never rejected
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

impl Default for LandmarkConfig {
    fn default() -> Self {
        Self {
            window_duration_ms: default_window_duration_ms(),
            motion_threshold: default_motion_threshold(),
            min_samples: default_min_samples(),
        }
    }
}

/// Queue sizing of the connection registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistrySettings {
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            outbound_capacity: default_outbound_capacity(),
            event_capacity: default_event_capacity(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_fps() -> u32 {
    15
}
fn default_quality() -> f32 {
    0.7
}
fn default_max_width() -> u32 {
    640
}
fn default_max_height() -> u32 {
    480
}
fn default_refresh_hz() -> u32 {
    60
}
fn default_max_retries() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_monitor_interval_ms() -> u64 {
    5000
}
fn default_window_duration_ms() -> u64 {
    1000
}
fn default_motion_threshold() -> f32 {
    0.08
}
fn default_min_samples() -> usize {
    2
}
fn default_outbound_capacity() -> usize {
    64
}
fn default_event_capacity() -> usize {
    256
}

impl Config {
    /// Loads configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads configuration from TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, link) in self.links.iter().enumerate() {
            let scheme_ok = ["ws://", "wss://", "mem://"]
                .iter()
                .any(|scheme| link.url.starts_with(scheme));
            if !scheme_ok {
                return Err(ConfigError::Invalid(format!(
                    "links[{}]: url must start with ws://, wss:// or mem://, got '{}'",
                    i, link.url
                )));
            }
        }

        self.validate_video()?;

        let r = &self.reconnect;
        if r.base_delay_ms > r.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnect: base-delay-ms ({}) exceeds max-delay-ms ({})",
                r.base_delay_ms, r.max_delay_ms
            )));
        }
        if !(r.backoff_multiplier >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "reconnect: backoff-multiplier must be >= 1, got {}",
                r.backoff_multiplier
            )));
        }
        if r.monitor_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect: monitor-interval-ms must be > 0".into(),
            ));
        }

        let l = &self.landmarks;
        if l.window_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "landmarks: window-duration-ms must be > 0".into(),
            ));
        }
        if !(l.motion_threshold > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "landmarks: motion-threshold must be > 0, got {}",
                l.motion_threshold
            )));
        }

        if self.registry.outbound_capacity == 0 || self.registry.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "registry: capacities must be > 0".into(),
            ));
        }

        Ok(())
    }

    fn validate_video(&self) -> Result<(), ConfigError> {
        let v = &self.video;

        if !ALLOWED_FPS.contains(&v.fps) {
            return Err(ConfigError::Invalid(format!(
                "video: fps must be one of {:?}, got {}",
                ALLOWED_FPS, v.fps
            )));
        }

        if !(0.3..=0.9).contains(&v.quality) {
            return Err(ConfigError::Invalid(format!(
                "video: quality must be between 0.3 and 0.9, got {}",
                v.quality
            )));
        }

        if v.max_width == 0 || v.max_height == 0 {
            return Err(ConfigError::Invalid(
                "video: max-width and max-height must be > 0".into(),
            ));
        }

        if !(1..=240).contains(&v.refresh_hz) {
            return Err(ConfigError::Invalid(format!(
                "video: refresh-hz must be between 1 and 240, got {}",
                v.refresh_hz
            )));
        }

        Ok(())
    }

    /// Saves configuration to TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
