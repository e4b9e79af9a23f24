// SPDX-License-Identifier: MPL-2.0

//! Core data types for the backpressure subsystem.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use crate::queue::PressureLevel;

/// Per-queue state machine position.
///
/// The discriminants match the severity order used when electing the most
/// severe queue in a tick, so the derived `Ord` is the election order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BackpressureState {
    /// startup, before the first decision
    Unknown = 0,
    Normal = 1,
    /// over the high watermark; producers should slow down
    Pressured = 2,
    /// dropping hard; producers should stop
    Overloaded = 3,
}

impl BackpressureState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Normal => "normal",
            Self::Pressured => "pressured",
            Self::Overloaded => "overloaded",
        }
    }
}

impl fmt::Display for BackpressureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory verb sent to producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BackpressureAction {
    /// resume normal production
    Normal = 0,
    /// reduce rate
    Throttle = 1,
    /// stop producing until a Normal signal arrives
    Pause = 2,
}

impl BackpressureAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Throttle => "throttle",
            Self::Pause => "pause",
        }
    }
}

impl fmt::Display for BackpressureAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Absolute high/low occupancy thresholds with a hysteresis band between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub high: usize,
    pub low: usize,
}

/// One sampled view of a queue. Derived on demand, never persisted.
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    pub queue_id: String,
    /// fill ratio, clamped to [0, 1]
    pub usage: f64,
    pub current_size: usize,
    pub capacity: usize,
    /// cumulative evictions
    pub drop_count: u64,
    /// evictions since the previous sample
    pub drop_delta: u64,
    pub pressure_level: PressureLevel,
    pub timestamp: SystemTime,
}

/// Callable the monitor polls for a queue's metrics. An `Err` is logged and
/// skips that registration for the tick.
pub type MetricsProvider = Arc<dyn Fn() -> eyre::Result<QueueMetrics> + Send + Sync>;

/// What a component hands the monitor to get a queue watched. The monitor
/// holds the callable, never the queue itself.
#[derive(Clone)]
pub struct Registration {
    pub queue_id: String,
    pub metrics_provider: MetricsProvider,
    pub capacity: usize,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("queue_id", &self.queue_id)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Components that own monitorable queues.
pub trait BackpressureSource {
    fn backpressure_registrations(&self) -> Vec<Registration>;
}

/// Payload published on the bus when the elected `(action, state)` changes.
#[derive(Debug, Clone)]
pub struct BackpressureSignal {
    /// the queue whose decision won the severity election
    pub queue_id: String,
    pub action: BackpressureAction,
    pub state: BackpressureState,
    pub reason: &'static str,
    pub usage: f64,
    pub drop_count: u64,
    pub pressure_level: PressureLevel,
    pub timestamp: SystemTime,
}
