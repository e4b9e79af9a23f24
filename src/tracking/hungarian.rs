// SPDX-License-Identifier: MPL-2.0

//! Globally optimal assignment on the cost matrix `1 − IoU`.
//!
//! The solver is the classic potentials formulation of the Hungarian
//! algorithm for rectangular matrices (rows ≤ columns, transposed
//! otherwise), O(r²·c). Box counts here are tens at most, so constant
//! factors are irrelevant; what matters is matching the optimal-assignment
//! semantics the tracking stage was tuned against.

use std::collections::HashMap;

use ndarray::{Array2, ArrayView2};

use crate::tracking::tracker::{iou_matrix, Tracker};

/// Minimum-cost one-to-one assignment.
///
/// Returns `(row, col)` pairs covering `min(nrows, ncols)` rows, sorted by
/// row. Empty matrices yield no pairs.
#[must_use]
pub fn linear_sum_assignment(cost: &Array2<f32>) -> Vec<(usize, usize)> {
    let (rows, cols) = cost.dim();
    if rows == 0 || cols == 0 {
        return Vec::new();
    }
    if rows > cols {
        let transposed = cost.t().to_owned();
        let mut pairs: Vec<(usize, usize)> = solve(&transposed)
            .into_iter()
            .map(|(r, c)| (c, r))
            .collect();
        pairs.sort_unstable();
        return pairs;
    }
    solve(cost)
}

/// Potentials method over a matrix with `nrows <= ncols`.
///
/// Indices are 1-based internally; column 0 is the virtual source column.
fn solve(cost: &Array2<f32>) -> Vec<(usize, usize)> {
    let n = cost.nrows();
    let m = cost.ncols();

    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; m + 1];
    // p[j]: row (1-based) currently assigned to column j, 0 if free
    let mut p = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];

        // grow an alternating tree until a free column is reached
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let reduced = f64::from(cost[[i0 - 1, j - 1]]) - u[i0] - v[j];
                if reduced < minv[j] {
                    minv[j] = reduced;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=m {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }

        // flip the augmenting path back to the source
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut pairs: Vec<(usize, usize)> = (1..=m)
        .filter(|&j| p[j] != 0)
        .map(|j| (p[j] - 1, j - 1))
        .collect();
    pairs.sort_unstable();
    pairs
}

/// Tracker that solves the assignment globally, then discards pairs whose
/// IoU falls below the threshold.
#[derive(Debug, Clone, Copy)]
pub struct HungarianTracker {
    threshold: f32,
}

impl HungarianTracker {
    #[must_use]
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Tracker for HungarianTracker {
    fn match_boxes(
        &self,
        prev: ArrayView2<f32>,
        curr: ArrayView2<f32>,
    ) -> (HashMap<usize, usize>, Array2<f32>) {
        let iou = iou_matrix(prev, curr);
        if iou.is_empty() {
            return (HashMap::new(), iou);
        }

        let cost = iou.mapv(|x| 1.0 - x);
        let matches = linear_sum_assignment(&cost)
            .into_iter()
            .filter(|&(i, j)| iou[[i, j]] >= self.threshold)
            .collect();
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

    fn total_cost(cost: &Array2<f32>, pairs: &[(usize, usize)]) -> f64 {
        pairs.iter().map(|&(i, j)| f64::from(cost[[i, j]])).sum()
    }

    /// Exhaustive minimum over all row-to-column injections.
    fn brute_force_min(cost: &Array2<f32>) -> f64 {
        fn recurse(cost: &Array2<f32>, row: usize, used: &mut Vec<bool>) -> f64 {
            if row == cost.nrows() {
                return 0.0;
            }
            let mut best = f64::INFINITY;
            for col in 0..cost.ncols() {
                if !used[col] {
                    used[col] = true;
                    let candidate = f64::from(cost[[row, col]]) + recurse(cost, row + 1, used);
                    best = best.min(candidate);
                    used[col] = false;
                }
            }
            best
        }
        recurse(cost, 0, &mut vec![false; cost.ncols()])
    }

    #[test]
    fn square_known_optimum() {
        let cost = array![[4.0f32, 1.0, 3.0], [2.0, 0.0, 5.0], [3.0, 2.0, 2.0]];
        let pairs = linear_sum_assignment(&cost);
        assert_eq!(pairs, vec![(0, 1), (1, 0), (2, 2)]);
        assert!((total_cost(&cost, &pairs) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn matches_brute_force_on_small_matrices() {
        let cases = [
            array![[0.9f32, 0.2, 0.7], [0.1, 0.8, 0.3], [0.6, 0.4, 0.5]],
            array![[1.0f32, 1.0, 1.0], [1.0, 0.0, 1.0], [0.0, 1.0, 1.0]],
            array![[0.25f32, 0.5, 0.125], [0.5, 0.25, 0.75], [0.125, 0.75, 0.0625]],
        ];
        for cost in cases {
            let pairs = linear_sum_assignment(&cost);
            assert_eq!(pairs.len(), 3);
            assert!(
                (total_cost(&cost, &pairs) - brute_force_min(&cost)).abs() < 1e-6,
                "suboptimal assignment for {cost:?}"
            );
        }
    }

    #[test]
    fn wide_matrix_assigns_every_row() {
        let cost = array![[5.0f32, 1.0, 9.0, 2.0], [4.0, 6.0, 1.0, 3.0]];
        let pairs = linear_sum_assignment(&cost);
        assert_eq!(pairs.len(), 2);
        assert!((total_cost(&cost, &pairs) - brute_force_min(&cost)).abs() < 1e-6);
        let mut cols: Vec<usize> = pairs.iter().map(|&(_, c)| c).collect();
        cols.sort_unstable();
        cols.dedup();
        assert_eq!(cols.len(), 2);
    }

    #[test]
    fn tall_matrix_assigns_every_column() {
        let cost = array![[5.0f32, 1.0], [4.0, 6.0], [2.0, 3.0], [7.0, 2.0]];
        let pairs = linear_sum_assignment(&cost);
        assert_eq!(pairs.len(), 2);
        // rows are a subset, columns fully covered
        let mut rows: Vec<usize> = pairs.iter().map(|&(r, _)| r).collect();
        rows.sort_unstable();
        rows.dedup();
        assert_eq!(rows.len(), 2);
        // optimum: row 0 -> col 1 (1.0), row 2 -> col 0 (2.0)
        assert_eq!(pairs, vec![(0, 1), (2, 0)]);
        assert!((total_cost(&cost, &pairs) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn empty_matrix_yields_no_pairs() {
        assert!(linear_sum_assignment(&Array2::<f32>::zeros((0, 3))).is_empty());
        assert!(linear_sum_assignment(&Array2::<f32>::zeros((3, 0))).is_empty());
    }

    #[test]
    fn tracker_filters_low_iou_assignments() {
        // two prev boxes, two curr boxes, but only one real overlap
        let prev = array![[0.0f32, 0.0, 0.2, 0.2], [0.8, 0.8, 1.0, 1.0]];
        let curr = array![[0.01f32, 0.01, 0.21, 0.21], [0.4, 0.4, 0.6, 0.6]];
        let tracker = HungarianTracker::new(0.5);
        let (matches, _) = tracker.match_boxes(prev.view(), curr.view());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches.get(&0), Some(&0));
    }
}
