// SPDX-License-Identifier: MPL-2.0

//! Streaming concurrency substrate for multi-camera RGB-D visualization.
//!
//! Sits between raw device events and the rendering surface:
//!
//! ```text
//! cameras ──► EventBus ──► DetectionProcessor ──► EventBus ──┐
//!     │                                                      │
//!     └────────────────────► EventBus ──────────────────► Packager ──► per-device
//!                                                            ▲         render queues
//!                         BackpressureMonitor ◄──────────────┘              │
//!                                │ advisory signals                     Renderer
//!                                ▼
//!                             producers
//! ```
//!
//! Everything inter-stage rides on [`queue::OverflowQueue`]: bounded,
//! drop-oldest, loss accounted. Delivery of every frame is explicitly not
//! guaranteed; under pressure the system sheds the oldest data and says
//! so through drop counters and backpressure events.

pub mod backpressure;
pub mod display;
pub mod error;
pub mod event_bus;
pub mod packager;
pub mod processor;
pub mod queue;
pub mod tracking;
pub mod types;

pub use backpressure::BackpressureMonitor;
pub use display::{DisplayOrchestrator, Renderer};
pub use event_bus::{Event, EventBus, EventType};
pub use packager::RenderPacketPackager;
pub use processor::DetectionProcessor;
pub use queue::OverflowQueue;
pub use types::{DetectionBatch, DeviceDetections, RenderPacket, VideoFrame};
