use std::time::Duration;

use flush::FlushConfig;
use painter::{PainterConfig, PainterConfigError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ConfigError {
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
    #[error("flush backoff base exceeds its maximum")]
    BackoffRangeInverted,
    #[error(transparent)]
    Painter(#[from] PainterConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    /// Chebyshev radius of the hot window around the vehicle tile.
    pub hot_radius_tiles: u32,
    pub tile_lru_capacity: usize,
    pub bitmap_lru_capacity: usize,
    /// Viewports spanning more tiles than this are rejected.
    pub max_viewport_tiles: u64,
    pub flush_workers: usize,
    pub flush_batch_cap: usize,
    pub flush_soft_limit: usize,
    pub flush_backoff_base_ms: u64,
    pub flush_backoff_max_ms: u64,
    pub flush_idle_poll_ms: u64,
    /// Upper bound on waiting for saves when a job stops.
    pub stop_drain_timeout_ms: u64,
    pub watchdog_interval_ms: u64,
    pub stuck_threshold_ms: u64,
    pub painter: PainterConfig,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            hot_radius_tiles: 2,
            tile_lru_capacity: 80,
            bitmap_lru_capacity: 56,
            max_viewport_tiles: 1024,
            flush_workers: 2,
            flush_batch_cap: 512,
            flush_soft_limit: 2048,
            flush_backoff_base_ms: 100,
            flush_backoff_max_ms: 5000,
            flush_idle_poll_ms: 20,
            stop_drain_timeout_ms: 10_000,
            watchdog_interval_ms: 5000,
            stuck_threshold_ms: 30_000,
            painter: PainterConfig::default(),
        }
    }
}

impl CoverageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("tile_lru_capacity", self.tile_lru_capacity as u64),
            ("bitmap_lru_capacity", self.bitmap_lru_capacity as u64),
            ("max_viewport_tiles", self.max_viewport_tiles),
            ("flush_workers", self.flush_workers as u64),
            ("flush_batch_cap", self.flush_batch_cap as u64),
            ("flush_idle_poll_ms", self.flush_idle_poll_ms),
            ("watchdog_interval_ms", self.watchdog_interval_ms),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.flush_backoff_base_ms > self.flush_backoff_max_ms {
            return Err(ConfigError::BackoffRangeInverted);
        }
        self.painter.validate()?;
        Ok(())
    }

    pub fn flush_config(&self) -> FlushConfig {
        FlushConfig {
            workers: self.flush_workers,
            batch_cap: self.flush_batch_cap,
            soft_limit: self.flush_soft_limit,
            backoff_base: Duration::from_millis(self.flush_backoff_base_ms),
            backoff_max: Duration::from_millis(self.flush_backoff_max_ms),
            idle_poll: Duration::from_millis(self.flush_idle_poll_ms),
            watchdog_interval: Duration::from_millis(self.watchdog_interval_ms),
            stuck_threshold: Duration::from_millis(self.stuck_threshold_ms),
        }
    }

    pub fn stop_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_drain_timeout_ms)
    }
}
