// SPDX-License-Identifier: MPL-2.0

//! Advisory backpressure: queue telemetry in, throttle signals out.
//!
//! The monitor samples registered queues on a fixed cadence, runs each
//! sample through a hysteresis state machine, elects the most severe
//! result across all queues, and publishes a [`BackpressureSignal`] on the
//! event bus whenever the elected `(action, state)` pair changes.
//! Producers decide for themselves whether to honor the advice; nothing
//! here slows a producer down directly.
//!
//! # Module Structure
//!
//! - [`types`]: states, actions, watermarks, metric snapshots, signal payload
//! - [`strategy`]: the pure decision functions (watermark computation, state transitions)
//! - [`provider`]: adapter turning an [`crate::queue::OverflowQueue`] into a metrics provider
//! - [`monitor`]: the polling thread and the process-wide singleton

pub mod monitor;
pub mod provider;
pub mod strategy;
pub mod types;

pub use monitor::BackpressureMonitor;
pub use provider::queue_metrics_provider;
pub use strategy::{compute_watermarks, decide_state};
pub use types::{
    BackpressureAction, BackpressureSignal, BackpressureSource, BackpressureState,
    MetricsProvider, QueueMetrics, Registration, Watermarks,
};
