// SPDX-License-Identifier: MPL-2.0

//! IoU computation and greedy bipartite matching.

use std::collections::HashMap;

use ndarray::{Array2, ArrayView2};

/// Avoids division by zero for degenerate (zero-area) box pairs.
const IOU_EPSILON: f32 = 1e-6;

/// Pairwise intersection-over-union for two box sets.
///
/// Boxes are `(xmin, ymin, xmax, ymax)` rows; the result is `(M, N)` where
/// `M = prev.nrows()`, `N = curr.nrows()`. Empty inputs yield an empty
/// matrix.
#[must_use]
pub fn iou_matrix(prev: ArrayView2<f32>, curr: ArrayView2<f32>) -> Array2<f32> {
    let (m, n) = (prev.nrows(), curr.nrows());
    let mut iou = Array2::zeros((m, n));
    if m == 0 || n == 0 {
        return iou;
    }

    let prev_areas: Vec<f32> = prev
        .outer_iter()
        .map(|b| (b[2] - b[0]) * (b[3] - b[1]))
        .collect();
    let curr_areas: Vec<f32> = curr
        .outer_iter()
        .map(|b| (b[2] - b[0]) * (b[3] - b[1]))
        .collect();

    for (i, p) in prev.outer_iter().enumerate() {
        for (j, c) in curr.outer_iter().enumerate() {
            let x1 = p[0].max(c[0]);
            let y1 = p[1].max(c[1]);
            let x2 = p[2].min(c[2]);
            let y2 = p[3].min(c[3]);
            let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
            let union = prev_areas[i] + curr_areas[j] - intersection;
            iou[[i, j]] = intersection / (union + IOU_EPSILON);
        }
    }
    iou
}

/// One-to-one association between a previous and a current box set.
///
/// `matches` maps previous-set indices to current-set indices and is
/// injective in both directions. The IoU matrix rides along for
/// diagnostics.
pub trait Tracker: Send + Sync {
    fn match_boxes(
        &self,
        prev: ArrayView2<f32>,
        curr: ArrayView2<f32>,
    ) -> (HashMap<usize, usize>, Array2<f32>);

    fn iou_threshold(&self) -> f32;
}

/// Global greedy matcher: all candidate pairs at or above the threshold,
/// taken in descending IoU order, each index used at most once. Ties keep
/// insertion order (row-major), so results are deterministic.
#[derive(Debug, Clone, Copy)]
pub struct GreedyTracker {
    threshold: f32,
}

impl GreedyTracker {
    #[must_use]
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Tracker for GreedyTracker {
    fn match_boxes(
        &self,
        prev: ArrayView2<f32>,
        curr: ArrayView2<f32>,
    ) -> (HashMap<usize, usize>, Array2<f32>) {
        let iou = iou_matrix(prev, curr);
        let (m, n) = iou.dim();
        if m == 0 || n == 0 {
            return (HashMap::new(), iou);
        }

        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for i in 0..m {
            for j in 0..n {
                if iou[[i, j]] >= self.threshold {
                    pairs.push((iou[[i, j]], i, j));
                }
            }
        }
        // stable sort keeps row-major insertion order among equal IoUs
        pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut matches = HashMap::new();
        let mut used_prev = vec![false; m];
        let mut used_curr = vec![false; n];
        for (_, i, j) in pairs {
            if !used_prev[i] && !used_curr[j] {
                matches.insert(i, j);
                used_prev[i] = true;
                used_curr[j] = true;
            }
        }
        (matches, iou)
    }

    fn iou_threshold(&self) -> f32 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn identical_boxes_have_unit_iou() {
        let boxes = array![[0.1f32, 0.1, 0.5, 0.5]];
        let iou = iou_matrix(boxes.view(), boxes.view());
        assert!((iou[[0, 0]] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn disjoint_boxes_have_zero_iou() {
        let a = array![[0.0f32, 0.0, 0.2, 0.2]];
        let b = array![[0.5f32, 0.5, 0.9, 0.9]];
        let iou = iou_matrix(a.view(), b.view());
        assert_eq!(iou[[0, 0]], 0.0);
    }

    #[test]
    fn empty_inputs_yield_empty_matrix_and_no_matches() {
        let empty = Array2::<f32>::zeros((0, 4));
        let some = array![[0.0f32, 0.0, 1.0, 1.0]];
        assert_eq!(iou_matrix(empty.view(), some.view()).dim(), (0, 1));

        let tracker = GreedyTracker::new(0.5);
        let (matches, iou) = tracker.match_boxes(empty.view(), some.view());
        assert!(matches.is_empty());
        assert_eq!(iou.dim(), (0, 1));
    }

    #[test]
    fn greedy_prefers_the_strongest_overlap() {
        // prev 0 overlaps both current boxes; the tighter one must win
        let prev = array![[0.0f32, 0.0, 0.4, 0.4], [0.6, 0.6, 1.0, 1.0]];
        let curr = array![
            [0.0f32, 0.0, 0.4, 0.42], // near-perfect match for prev 0
            [0.05, 0.05, 0.45, 0.45], // decent match for prev 0 only
        ];
        let tracker = GreedyTracker::new(0.3);
        let (matches, _) = tracker.match_boxes(prev.view(), curr.view());
        assert_eq!(matches.get(&0), Some(&0));
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn matches_are_one_to_one() {
        let prev = array![
            [0.0f32, 0.0, 0.3, 0.3],
            [0.0, 0.0, 0.32, 0.32],
            [0.7, 0.7, 1.0, 1.0]
        ];
        let curr = array![[0.0f32, 0.0, 0.31, 0.31], [0.69, 0.69, 1.0, 1.0]];
        let tracker = GreedyTracker::new(0.2);
        let (matches, _) = tracker.match_boxes(prev.view(), curr.view());

        let mut seen_curr: Vec<usize> = matches.values().copied().collect();
        seen_curr.sort_unstable();
        seen_curr.dedup();
        assert_eq!(seen_curr.len(), matches.len());
        assert_eq!(matches.len(), 2);
    }
}
