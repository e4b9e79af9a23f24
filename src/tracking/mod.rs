// SPDX-License-Identifier: MPL-2.0

//! Frame-to-frame association and 3D coordinate smoothing.
//!
//! ```text
//! DetectionBatch ──► FilterManager (per device)
//!                        │ routes rows by label
//!                        ▼
//!                    FilterPool (per device × label)
//!                        │ IoU-matches rows to active slots
//!                        ▼
//!                    SpatialFilter (per tracked target)
//!                        │ sliding-window smoothing
//!                        ▼
//!                  smoothed coordinates
//! ```
//!
//! Slots live and die by miss counting: a target unmatched for more than
//! `max_miss` consecutive frames frees its slot for a new target.

pub mod filter;
pub mod hungarian;
pub mod manager;
pub mod pool;
pub mod tracker;

pub use filter::{MovingAverageFilter, SpatialFilter, WeightedMovingAverageFilter};
pub use hungarian::HungarianTracker;
pub use manager::{FilterManager, PoolStats};
pub use pool::FilterPool;
pub use tracker::{iou_matrix, GreedyTracker, Tracker};

use depthview_config::{FilterConfig, FilterKind, TrackerKind};

/// Build the tracker selected by configuration.
#[must_use]
pub fn make_tracker(kind: TrackerKind, iou_threshold: f32) -> Box<dyn Tracker> {
    match kind {
        TrackerKind::Greedy => Box::new(GreedyTracker::new(iou_threshold)),
        TrackerKind::Hungarian => Box::new(HungarianTracker::new(iou_threshold)),
    }
}

/// Build the smoother selected by configuration.
#[must_use]
pub fn make_filter(config: &FilterConfig) -> Box<dyn SpatialFilter> {
    match config.filter {
        FilterKind::MovingAverage => Box::new(MovingAverageFilter::new(
            config.window,
            config.max_miss,
            config.recalc_interval,
        )),
        FilterKind::WeightedMovingAverage => Box::new(WeightedMovingAverageFilter::new(
            config.window,
            config.max_miss,
        )),
    }
}
