// SPDX-License-Identifier: MPL-2.0

//! Typed configuration for the depthview pipeline.
//!
//! Plain data with explicit validation. Discovery and persistence of
//! configuration belong to external tooling; the only I/O here is an
//! optional RON settings file.

use std::path::Path;
use std::time::Duration;

use derive_setters::Setters;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings file: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("{field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// One stereo camera. `id` is the device's opaque MXid.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub id: String,
    /// human-readable name used in logs
    #[serde(default)]
    pub alias: Option<String>,
}

impl DeviceEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            alias: None,
        }
    }
}

/// Advisory backpressure thresholds, shared by the monitor and its tests.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Setters)]
#[serde(default)]
#[must_use]
pub struct BackpressureConfig {
    /// monitor poll cadence in milliseconds
    pub poll_interval_ms: u64,
    /// high watermark as a fraction of capacity
    pub high_ratio: f64,
    /// low watermark as a fraction of capacity
    pub low_ratio: f64,
    /// consecutive high-watermark hits before entering Pressured
    pub high_hits_threshold: u32,
    /// consecutive low-watermark hits before leaving Pressured
    pub low_hits_threshold: u32,
    /// queues smaller than this use fixed watermark fractions
    pub min_capacity: usize,
    /// drops per tick (as a fraction of capacity) that force Overloaded
    pub drop_rate_threshold: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            high_ratio: 0.8,
            low_ratio: 0.5,
            high_hits_threshold: 2,
            low_hits_threshold: 2,
            min_capacity: 10,
            drop_rate_threshold: 0.5,
        }
    }
}

impl BackpressureConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", "must be > 0"));
        }
        if !(self.low_ratio > 0.0 && self.low_ratio < self.high_ratio && self.high_ratio <= 1.0) {
            return Err(invalid(
                "high_ratio/low_ratio",
                format!(
                    "require 0 < low_ratio < high_ratio <= 1, got low={} high={}",
                    self.low_ratio, self.high_ratio
                ),
            ));
        }
        if self.high_hits_threshold == 0 {
            return Err(invalid("high_hits_threshold", "must be >= 1"));
        }
        if self.low_hits_threshold == 0 {
            return Err(invalid("low_hits_threshold", "must be >= 1"));
        }
        if self.drop_rate_threshold < 0.0 {
            return Err(invalid("drop_rate_threshold", "must be >= 0"));
        }
        Ok(())
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Frame/detection pairing stage knobs.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Setters)]
#[serde(default)]
#[must_use]
pub struct PackagerConfig {
    /// capacity of the input queue and of each per-device output queue
    pub queue_capacity: usize,
    /// worker blocking-get timeout; bounds shutdown latency
    pub poll_timeout_ms: u64,
    /// a half-pair older than this is purged and counted as a drop
    pub pairing_timeout_ms: u64,
    /// hard cap on outstanding half-pairs; oldest is evicted beyond it
    pub max_pending: usize,
}

impl Default for PackagerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 8,
            poll_timeout_ms: 100,
            pairing_timeout_ms: 200,
            max_pending: 256,
        }
    }
}

impl PackagerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be > 0"));
        }
        if self.poll_timeout_ms == 0 {
            return Err(invalid("poll_timeout_ms", "must be > 0"));
        }
        if self.pairing_timeout_ms == 0 {
            return Err(invalid("pairing_timeout_ms", "must be > 0"));
        }
        if self.max_pending == 0 {
            return Err(invalid("max_pending", "must be > 0"));
        }
        Ok(())
    }

    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    #[must_use]
    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_millis(self.pairing_timeout_ms)
    }
}

/// Bipartite matching strategy for frame-to-frame association.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrackerKind {
    Greedy,
    #[default]
    Hungarian,
}

/// Coordinate smoothing strategy.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    #[default]
    MovingAverage,
    WeightedMovingAverage,
}

/// Tracking-and-smoothing knobs, applied per (device, label) pool.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Setters)]
#[serde(default)]
#[must_use]
pub struct FilterConfig {
    /// slots per pool; 0 is legal and disables smoothing for that class
    pub pool_size: usize,
    /// sliding-window length of each smoother
    pub window: usize,
    /// consecutive misses a slot survives before it is recycled
    pub max_miss: u32,
    /// full re-sum every `window * recalc_interval` inputs
    pub recalc_interval: usize,
    pub iou_threshold: f32,
    pub tracker: TrackerKind,
    pub filter: FilterKind,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            pool_size: 32,
            window: 8,
            max_miss: 5,
            recalc_interval: 10,
            iou_threshold: 0.5,
            tracker: TrackerKind::default(),
            filter: FilterKind::default(),
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window == 0 {
            return Err(invalid("window", "must be > 0"));
        }
        if self.recalc_interval == 0 {
            return Err(invalid("recalc_interval", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(invalid(
                "iou_threshold",
                format!("must be within [0, 1], got {}", self.iou_threshold),
            ));
        }
        Ok(())
    }
}

/// Renderer-facing knobs for the display orchestrator.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct DisplayConfig {
    /// start the external renderer on orchestrator start
    pub enable_display: bool,
    /// cadence at which the consumer drains render packets
    pub consume_interval_ms: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enable_display: true,
            consume_interval_ms: 33,
        }
    }
}

impl DisplayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consume_interval_ms == 0 {
            return Err(invalid("consume_interval_ms", "must be > 0"));
        }
        Ok(())
    }

    #[must_use]
    pub fn consume_interval(&self) -> Duration {
        Duration::from_millis(self.consume_interval_ms)
    }
}

/// Top-level settings for a depthview deployment.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    pub devices: Vec<DeviceEntry>,
    /// detection class names, indexed by the network's label index
    pub labels: Vec<String>,
    pub backpressure: BackpressureConfig,
    pub packager: PackagerConfig,
    pub filter: FilterConfig,
    pub display: DisplayConfig,
}

impl Settings {
    /// Load settings from a RON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let settings: Settings = ron::from_str(&raw)?;
        settings.validate()?;
        tracing::info!(
            path = %path.display(),
            devices = settings.devices.len(),
            labels = settings.labels.len(),
            "loaded settings"
        );
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(invalid("devices", "at least one device is required"));
        }
        for entry in &self.devices {
            if entry.id.is_empty() {
                return Err(invalid("devices", "device id must not be empty"));
            }
        }
        let mut ids: Vec<&str> = self.devices.iter().map(|d| d.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.devices.len() {
            return Err(invalid("devices", "device ids must be unique"));
        }
        if self.labels.is_empty() {
            return Err(invalid("labels", "at least one label is required"));
        }
        self.backpressure.validate()?;
        self.packager.validate()?;
        self.filter.validate()?;
        self.display.validate()?;
        Ok(())
    }

    #[must_use]
    pub fn device_ids(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.id.clone()).collect()
    }
}
