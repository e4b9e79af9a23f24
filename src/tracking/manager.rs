// SPDX-License-Identifier: MPL-2.0

//! Routes a device's detection batch to its per-label filter pools.
//!
//! Pools for every (device, label) combination are built eagerly at
//! startup; the per-frame path only looks up into a fixed structure and
//! never allocates pools. Output rows come back grouped by ascending label,
//! not in input order; the renderer doesn't care.

use std::collections::HashMap;

use ndarray::{concatenate, Array1, Array2, ArrayView1, ArrayView2, Axis};

use depthview_config::FilterConfig;

use crate::tracking::pool::FilterPool;
use crate::tracking::{make_filter, make_tracker};

/// Per-pool occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub active_count: usize,
}

/// Filtered output of [`FilterManager::process`], grouped by label.
pub type FilteredBatch = (Array2<f32>, Array2<f32>, Array1<f32>, Array1<i32>);

pub struct FilterManager {
    /// device id → label index → pool
    pools: HashMap<String, HashMap<i32, FilterPool>>,
}

impl FilterManager {
    /// Eagerly build pools for the full device × label product.
    #[must_use]
    pub fn new(device_ids: &[String], label_count: usize, config: &FilterConfig) -> Self {
        let mut pools: HashMap<String, HashMap<i32, FilterPool>> = HashMap::new();
        let factory_config = *config;
        let factory = move || make_filter(&factory_config);
        for device_id in device_ids {
            let device_pools = pools.entry(device_id.clone()).or_default();
            for label in 0..label_count {
                device_pools.insert(
                    label as i32,
                    FilterPool::new(
                        config.pool_size,
                        &factory,
                        make_tracker(config.tracker, config.iou_threshold),
                    ),
                );
            }
        }
        tracing::info!(
            devices = device_ids.len(),
            labels = label_count,
            pool_size = config.pool_size,
            "filter pools created"
        );
        Self { pools }
    }

    /// Smooth one frame's detections for `device_id`.
    ///
    /// Inputs are parallel arrays of length `n`; outputs are the same four
    /// arrays with coordinates replaced by the pool output, concatenated
    /// label-block by label-block in ascending label order.
    pub fn process(
        &mut self,
        device_id: &str,
        coords: ArrayView2<f32>,
        bboxes: ArrayView2<f32>,
        confidences: ArrayView1<f32>,
        labels: ArrayView1<i32>,
    ) -> FilteredBatch {
        let n = labels.len();
        if n == 0 {
            return empty_batch();
        }

        let mut unique_labels: Vec<i32> = labels.to_vec();
        unique_labels.sort_unstable();
        unique_labels.dedup();

        let mut out_coords: Vec<Array2<f32>> = Vec::with_capacity(unique_labels.len());
        let mut out_bboxes: Vec<Array2<f32>> = Vec::with_capacity(unique_labels.len());
        let mut out_confidences: Vec<Array1<f32>> = Vec::with_capacity(unique_labels.len());
        let mut out_labels: Vec<Array1<i32>> = Vec::with_capacity(unique_labels.len());

        for &label in &unique_labels {
            let row_indices: Vec<usize> = labels
                .iter()
                .enumerate()
                .filter(|&(_, &l)| l == label)
                .map(|(i, _)| i)
                .collect();

            let coord_slice = coords.select(Axis(0), &row_indices);
            let bbox_slice = bboxes.select(Axis(0), &row_indices);
            let confidence_slice = confidences.select(Axis(0), &row_indices);

            let Some(pool) = self
                .pools
                .get_mut(device_id)
                .and_then(|device_pools| device_pools.get_mut(&label))
            else {
                // eager construction covers the whole product; reaching this
                // means an unconfigured device or label slipped upstream
                tracing::warn!(device_id, label, "no filter pool; dropping slice");
                continue;
            };

            let filtered = pool.step(
                coord_slice.view(),
                bbox_slice.view(),
                confidence_slice.view(),
            );

            out_labels.push(Array1::from_elem(filtered.nrows(), label));
            out_coords.push(filtered);
            out_bboxes.push(bbox_slice);
            out_confidences.push(confidence_slice);
        }

        if out_coords.is_empty() {
            return empty_batch();
        }

        let coords_views: Vec<_> = out_coords.iter().map(|a| a.view()).collect();
        let bboxes_views: Vec<_> = out_bboxes.iter().map(|a| a.view()).collect();
        let confidence_views: Vec<_> = out_confidences.iter().map(|a| a.view()).collect();
        let label_views: Vec<_> = out_labels.iter().map(|a| a.view()).collect();
        (
            concatenate(Axis(0), &coords_views).expect("label blocks share width 3"),
            concatenate(Axis(0), &bboxes_views).expect("label blocks share width 4"),
            concatenate(Axis(0), &confidence_views).expect("1-d blocks always concatenate"),
            concatenate(Axis(0), &label_views).expect("1-d blocks always concatenate"),
        )
    }

    /// Occupancy of every pool, keyed by (device, label).
    #[must_use]
    pub fn pool_stats(&self) -> HashMap<(String, i32), PoolStats> {
        let mut stats = HashMap::new();
        for (device_id, device_pools) in &self.pools {
            for (&label, pool) in device_pools {
                stats.insert(
                    (device_id.clone(), label),
                    PoolStats {
                        capacity: pool.capacity(),
                        active_count: pool.active_count(),
                    },
                );
            }
        }
        stats
    }

    /// Clear every pool (all targets forgotten).
    pub fn reset(&mut self) {
        for device_pools in self.pools.values_mut() {
            for pool in device_pools.values_mut() {
                pool.reset();
            }
        }
    }
}

impl std::fmt::Debug for FilterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pools: usize = self.pools.values().map(HashMap::len).sum();
        f.debug_struct("FilterManager")
            .field("devices", &self.pools.len())
            .field("pools", &pools)
            .finish()
    }
}

fn empty_batch() -> FilteredBatch {
    (
        Array2::zeros((0, 3)),
        Array2::zeros((0, 4)),
        Array1::zeros(0),
        Array1::zeros(0),
    )
}
