// SPDX-License-Identifier: MPL-2.0

//! Sliding-window smoothers for 3D coordinates.
//!
//! A filter tracks one target. It holds the last `window` coordinates, the
//! bbox it was last matched at, and a miss counter: once a target goes
//! unmatched for more than `max_miss` consecutive frames the filter resets
//! itself and reports inactive, freeing its pool slot.

use std::collections::VecDeque;

/// Smoothing state machine shared by all filter variants.
///
/// Lifecycle: constructed inactive (`current_value == None`); the first
/// `input` activates it; `miss`/`predict` beyond `max_miss` fully resets it.
pub trait SpatialFilter: Send {
    /// Feed a matched observation. Resets the miss counter and returns the
    /// new smoothed value.
    fn input(&mut self, coord: [f32; 3], bbox: [f32; 4]) -> [f32; 3];

    /// Record one unmatched frame. Returns `false` (after a full reset)
    /// once the miss budget is exhausted.
    fn miss(&mut self) -> bool;

    /// Like `miss`, but hands back the held estimate while the target is
    /// still within its miss budget.
    fn predict(&mut self) -> Option<[f32; 3]>;

    fn is_valid(&self) -> bool;

    /// Clear everything: window, sums, estimate, bbox, miss counter.
    fn reset(&mut self);

    fn current_value(&self) -> Option<[f32; 3]>;

    fn current_bbox(&self) -> Option<[f32; 4]>;

    /// Number of observations currently in the window.
    fn window_len(&self) -> usize;
}

/// State common to the smoothing variants.
#[derive(Debug, Clone)]
struct WindowState {
    window: VecDeque<[f32; 3]>,
    window_cap: usize,
    current_value: Option<[f32; 3]>,
    current_bbox: Option<[f32; 4]>,
    miss_count: u32,
    max_miss: u32,
}

impl WindowState {
    fn new(window_cap: usize, max_miss: u32) -> Self {
        let window_cap = window_cap.max(1);
        Self {
            window: VecDeque::with_capacity(window_cap),
            window_cap,
            current_value: None,
            current_bbox: None,
            miss_count: 0,
            max_miss,
        }
    }

    /// Append `coord`, returning the evicted oldest entry if the window was
    /// full.
    fn push(&mut self, coord: [f32; 3]) -> Option<[f32; 3]> {
        let evicted = if self.window.len() == self.window_cap {
            self.window.pop_front()
        } else {
            None
        };
        self.window.push_back(coord);
        evicted
    }

    /// Count one miss; `true` while the budget lasts.
    fn tick_miss(&mut self) -> bool {
        self.miss_count += 1;
        self.miss_count <= self.max_miss
    }

    fn clear(&mut self) {
        self.window.clear();
        self.current_value = None;
        self.current_bbox = None;
        self.miss_count = 0;
    }
}

/// Arithmetic-mean smoother with an O(1) incremental sum.
///
/// The running sum is corrected by a full re-summation every
/// `window * recalc_interval` inputs to keep accumulated float error from
/// drifting the mean on long-lived targets.
#[derive(Debug, Clone)]
pub struct MovingAverageFilter {
    state: WindowState,
    sum: [f32; 3],
    size: usize,
    update_count: usize,
    recalc_every: usize,
}

impl MovingAverageFilter {
    #[must_use]
    pub fn new(window: usize, max_miss: u32, recalc_interval: usize) -> Self {
        let window = window.max(1);
        Self {
            state: WindowState::new(window, max_miss),
            sum: [0.0; 3],
            size: 0,
            update_count: 0,
            recalc_every: window * recalc_interval.max(1),
        }
    }

    fn resum(&mut self) {
        self.sum = [0.0; 3];
        for coord in &self.state.window {
            for axis in 0..3 {
                self.sum[axis] += coord[axis];
            }
        }
        self.size = self.state.window.len();
    }
}

impl SpatialFilter for MovingAverageFilter {
    fn input(&mut self, coord: [f32; 3], bbox: [f32; 4]) -> [f32; 3] {
        self.state.miss_count = 0;
        let evicted = self.state.push(coord);
        self.state.current_bbox = Some(bbox);

        self.update_count += 1;
        if self.update_count % self.recalc_every == 0 {
            self.resum();
        } else {
            if let Some(old) = evicted {
                for axis in 0..3 {
                    self.sum[axis] -= old[axis];
                }
            } else {
                self.size += 1;
            }
            for axis in 0..3 {
                self.sum[axis] += coord[axis];
            }
        }

        let size = self.size as f32;
        let value = [self.sum[0] / size, self.sum[1] / size, self.sum[2] / size];
        self.state.current_value = Some(value);
        value
    }

    fn miss(&mut self) -> bool {
        if self.state.tick_miss() {
            true
        } else {
            self.reset();
            false
        }
    }

    fn predict(&mut self) -> Option<[f32; 3]> {
        if self.state.tick_miss() {
            self.state.current_value
        } else {
            self.reset();
            None
        }
    }

    fn is_valid(&self) -> bool {
        self.state.miss_count <= self.state.max_miss
    }

    fn reset(&mut self) {
        self.state.clear();
        self.sum = [0.0; 3];
        self.size = 0;
        self.update_count = 0;
    }

    fn current_value(&self) -> Option<[f32; 3]> {
        self.state.current_value
    }

    fn current_bbox(&self) -> Option<[f32; 4]> {
        self.state.current_bbox
    }

    fn window_len(&self) -> usize {
        self.state.window.len()
    }
}

/// Weighted-mean smoother biased toward recent observations.
///
/// Weights rise linearly with recency and are normalized. The full-window
/// weights are precomputed at construction; shorter windows (while warming
/// up) recompute on the fly. There is no incremental fast path: the
/// weighted sum is recomputed each input, which is fine at the window sizes
/// used here.
#[derive(Debug, Clone)]
pub struct WeightedMovingAverageFilter {
    state: WindowState,
    full_weights: Vec<f32>,
}

impl WeightedMovingAverageFilter {
    #[must_use]
    pub fn new(window: usize, max_miss: u32) -> Self {
        let window = window.max(1);
        Self {
            state: WindowState::new(window, max_miss),
            full_weights: Self::weights(window),
        }
    }

    /// Normalized linearly increasing weights `1..=n`.
    fn weights(n: usize) -> Vec<f32> {
        let total = (n * (n + 1)) as f32 / 2.0;
        (1..=n).map(|k| k as f32 / total).collect()
    }

    fn weighted_mean(&self) -> [f32; 3] {
        let n = self.state.window.len();
        let recomputed;
        let weights = if n == self.full_weights.len() {
            &self.full_weights
        } else {
            recomputed = Self::weights(n);
            &recomputed
        };

        let mut mean = [0.0f32; 3];
        for (coord, w) in self.state.window.iter().zip(weights) {
            for axis in 0..3 {
                mean[axis] += coord[axis] * w;
            }
        }
        mean
    }
}

impl SpatialFilter for WeightedMovingAverageFilter {
    fn input(&mut self, coord: [f32; 3], bbox: [f32; 4]) -> [f32; 3] {
        self.state.miss_count = 0;
        let _ = self.state.push(coord);
        self.state.current_bbox = Some(bbox);

        let value = self.weighted_mean();
        self.state.current_value = Some(value);
        value
    }

    fn miss(&mut self) -> bool {
        if self.state.tick_miss() {
            true
        } else {
            self.reset();
            false
        }
    }

    fn predict(&mut self) -> Option<[f32; 3]> {
        if self.state.tick_miss() {
            self.state.current_value
        } else {
            self.reset();
            None
        }
    }

    fn is_valid(&self) -> bool {
        self.state.miss_count <= self.state.max_miss
    }

    fn reset(&mut self) {
        self.state.clear();
    }

    fn current_value(&self) -> Option<[f32; 3]> {
        self.state.current_value
    }

    fn current_bbox(&self) -> Option<[f32; 4]> {
        self.state.current_bbox
    }

    fn window_len(&self) -> usize {
        self.state.window.len()
    }
}
