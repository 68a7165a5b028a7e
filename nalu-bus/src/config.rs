use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DecoderInitError;
use crate::feeder::{DEFAULT_STOP_TIMEOUT, FeederOptions, INPUT_WAIT_SLICE, StopMode};
use crate::nalu::NALU_MAXLEN;
use crate::notifier::DEFAULT_POLL_INTERVAL;
use crate::queue::OverflowPolicy;
use crate::stats::DEFAULT_STATS_WINDOW;

pub const DEFAULT_QUEUE_CAPACITY: usize = 32;
pub const DEFAULT_CHUNK_SIZE: usize = 1024;
pub const DEFAULT_UDP_BUFFER_SIZE: usize = 64 * 1024;

/// Everything a session needs besides its source and sink. Deserializes from
/// partial JSON, missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub stop_mode: StopMode,
    pub stop_timeout_ms: u64,
    pub stats_window_ms: u64,
    pub poll_interval_ms: u64,
    /// Read size for file and asset sources.
    pub chunk_size: usize,
    /// Caps playback speed of file and asset sources. `None` reads as fast
    /// as the queue accepts.
    pub max_fps: Option<u32>,
    pub udp_buffer_size: usize,
    pub max_unit_len: usize,
    pub assets_dir: PathBuf,
    /// Raw `.h264` copies of live streams are written here when set.
    pub record_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
            stop_mode: StopMode::default(),
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT.as_millis() as u64,
            stats_window_ms: DEFAULT_STATS_WINDOW.as_millis() as u64,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_fps: None,
            udp_buffer_size: DEFAULT_UDP_BUFFER_SIZE,
            max_unit_len: NALU_MAXLEN,
            assets_dir: PathBuf::from("assets"),
            record_dir: None,
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {}: {}", path.display(), e))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), DecoderInitError> {
        if self.queue_capacity == 0 {
            return Err(DecoderInitError::Config(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(DecoderInitError::Config(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        if self.stats_window_ms == 0 || self.poll_interval_ms == 0 {
            return Err(DecoderInitError::Config(
                "stats_window_ms and poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.max_fps == Some(0) {
            return Err(DecoderInitError::Config(
                "max_fps must be positive when set".to_string(),
            ));
        }
        if self.max_unit_len == 0 {
            return Err(DecoderInitError::Config(
                "max_unit_len must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn stats_window(&self) -> Duration {
        Duration::from_millis(self.stats_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub(crate) fn feeder_options(&self) -> FeederOptions {
        FeederOptions {
            stop_mode: self.stop_mode,
            stop_timeout: self.stop_timeout(),
            input_wait_slice: INPUT_WAIT_SLICE,
        }
    }
}

#[derive(Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Queue size and what to do when it is full.
    pub fn queue(mut self, capacity: usize, overflow: OverflowPolicy) -> Self {
        self.config.queue_capacity = capacity;
        self.config.overflow = overflow;
        self
    }

    pub fn stop_mode(mut self, mode: StopMode) -> Self {
        self.config.stop_mode = mode;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn stats_window(mut self, window: Duration) -> Self {
        self.config.stats_window_ms = window.as_millis() as u64;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    pub fn max_fps(mut self, fps: u32) -> Self {
        self.config.max_fps = Some(fps);
        self
    }

    pub fn udp_buffer_size(mut self, size: usize) -> Self {
        self.config.udp_buffer_size = size;
        self
    }

    pub fn max_unit_len(mut self, len: usize) -> Self {
        self.config.max_unit_len = len;
        self
    }

    pub fn assets_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.assets_dir = dir.into();
        self
    }

    pub fn record_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.record_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
