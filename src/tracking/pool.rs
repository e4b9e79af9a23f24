// SPDX-License-Identifier: MPL-2.0

//! Fixed pool of filter slots for one (device, label) class.
//!
//! Per frame: match incoming boxes against the boxes held by active slots,
//! feed matches, count misses on the rest, admit leftovers into free slots.
//! When every slot is busy, surplus detections stay unassigned and their
//! output rows remain zero: saturation degrades, it never fails.

use std::collections::HashMap;

use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::tracking::filter::SpatialFilter;
use crate::tracking::tracker::Tracker;

pub type FilterFactory = dyn Fn() -> Box<dyn SpatialFilter> + Send + Sync;

pub struct FilterPool {
    slots: Vec<Box<dyn SpatialFilter>>,
    active: Vec<bool>,
    tracker: Box<dyn Tracker>,
}

impl FilterPool {
    /// `pool_size` of zero is legal: the pool then tracks nothing and every
    /// output row stays zero-initialized.
    #[must_use]
    pub fn new(pool_size: usize, filter_factory: &FilterFactory, tracker: Box<dyn Tracker>) -> Self {
        Self {
            slots: (0..pool_size).map(|_| filter_factory()).collect(),
            active: vec![false; pool_size],
            tracker,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|&&a| a).count()
    }

    /// Clear every slot and deactivate the whole pool.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.reset();
        }
        self.active.fill(false);
    }

    /// Process one frame's detections for this class.
    ///
    /// `coords` is `(n, 3)`, `bboxes` `(n, 4)`, `confidences` `(n,)`; the
    /// returned array is `(n, 3)` where row `i` holds the smoothed value of
    /// the slot that took detection `i`, or zeros if the pool was
    /// saturated.
    pub fn step(
        &mut self,
        coords: ArrayView2<f32>,
        bboxes: ArrayView2<f32>,
        confidences: ArrayView1<f32>,
    ) -> Array2<f32> {
        let n = coords.nrows();
        debug_assert_eq!(bboxes.nrows(), n);
        debug_assert_eq!(confidences.len(), n);

        if n == 0 {
            // nothing arrived: everyone active takes a miss
            for i in 0..self.slots.len() {
                if self.active[i] {
                    self.active[i] = self.slots[i].miss();
                }
            }
            self.cleanup_inactive();
            return Array2::zeros((0, 3));
        }

        let mut output = Array2::zeros((n, 3));

        let (candidate_slots, candidate_boxes) = self.active_candidates();
        let matches: HashMap<usize, usize> = if candidate_slots.is_empty() {
            HashMap::new()
        } else {
            self.tracker
                .match_boxes(candidate_boxes.view(), bboxes)
                .0
        };

        let mut used_curr = vec![false; n];
        let mut matched_slot = vec![false; self.slots.len()];
        for (&local_idx, &curr_idx) in &matches {
            let slot_idx = candidate_slots[local_idx];
            let smoothed = self.slots[slot_idx].input(row3(coords, curr_idx), row4(bboxes, curr_idx));
            write_row(&mut output, curr_idx, smoothed);
            used_curr[curr_idx] = true;
            matched_slot[slot_idx] = true;
        }

        // unmatched active slots age out through their miss budget
        for i in 0..self.slots.len() {
            if self.active[i] && !matched_slot[i] {
                self.active[i] = self.slots[i].miss();
            }
        }

        // admit new targets into free slots, in detection order
        let free_slots: Vec<usize> = (0..self.slots.len()).filter(|&i| !self.active[i]).collect();
        let mut free_iter = free_slots.into_iter();
        for curr_idx in 0..n {
            if used_curr[curr_idx] {
                continue;
            }
            let Some(slot_idx) = free_iter.next() else {
                break; // saturated: remaining rows stay zero
            };
            self.slots[slot_idx].reset();
            let smoothed = self.slots[slot_idx].input(row3(coords, curr_idx), row4(bboxes, curr_idx));
            write_row(&mut output, curr_idx, smoothed);
            self.active[slot_idx] = true;
        }

        self.cleanup_inactive();
        output
    }

    /// Active slots that can participate in matching, with their boxes.
    ///
    /// An active slot without a bbox cannot be matched; that state is
    /// inconsistent, so the slot is deactivated on the spot.
    fn active_candidates(&mut self) -> (Vec<usize>, Array2<f32>) {
        let mut indices = Vec::new();
        let mut boxes = Vec::new();
        for i in 0..self.slots.len() {
            if !self.active[i] {
                continue;
            }
            match self.slots[i].current_bbox() {
                Some(bbox) => {
                    indices.push(i);
                    boxes.push(bbox);
                }
                None => self.active[i] = false,
            }
        }

        let mut matrix = Array2::zeros((indices.len(), 4));
        for (row, bbox) in boxes.iter().enumerate() {
            for (col, value) in bbox.iter().enumerate() {
                matrix[[row, col]] = *value;
            }
        }
        (indices, matrix)
    }

    /// Keep the activity bitmap consistent with slot state: a slot whose
    /// estimate is gone holds nothing worth tracking.
    fn cleanup_inactive(&mut self) {
        for i in 0..self.slots.len() {
            if self.active[i]
                && self.slots[i].current_value().is_none()
                && self.slots[i].window_len() == 0
            {
                self.active[i] = false;
            }
        }
    }

    /// Bitmap/slot consistency probe used by tests and stats.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.active
            .iter()
            .zip(&self.slots)
            .all(|(&active, slot)| active == slot.current_value().is_some())
    }
}

impl std::fmt::Debug for FilterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterPool")
            .field("capacity", &self.capacity())
            .field("active_count", &self.active_count())
            .finish()
    }
}

fn row3(array: ArrayView2<f32>, row: usize) -> [f32; 3] {
    [array[[row, 0]], array[[row, 1]], array[[row, 2]]]
}

fn row4(array: ArrayView2<f32>, row: usize) -> [f32; 4] {
    [
        array[[row, 0]],
        array[[row, 1]],
        array[[row, 2]],
        array[[row, 3]],
    ]
}

fn write_row(output: &mut Array2<f32>, row: usize, value: [f32; 3]) {
    for (col, v) in value.iter().enumerate() {
        output[[row, col]] = *v;
    }
}
