//! Herding-based exemplar selection.
//!
//! Greedy mean-matching: at each step the candidate whose inclusion brings
//! the running mean of selected feature vectors closest to the class mean is
//! taken. The first `count_raw` picks become permanent raw exemplars; the
//! remaining `count_proxy` picks name the images handed to reconstruction.
//! Both are drawn from one shared candidate pool in a single ranked pass,
//! never re-ranked independently.

use ndarray::{Array1, Array2, ArrayView1, Axis};

use crate::error::{RehearsalError, Result};
use crate::EPSILON;

/// Indices chosen by one herding pass, in selection order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionSplit {
    /// Raw exemplar indices (first `count_raw` selections).
    pub raw: Vec<usize>,
    /// Proxy-source indices (remaining selections).
    pub proxy: Vec<usize>,
}

/// L2-normalizes each row of a feature matrix.
///
/// Every mean or distance computation in this crate operates on
/// unit-normalized feature vectors.
pub fn l2_normalize_rows(features: &Array2<f32>) -> Array2<f32> {
    let mut normalized = features.clone();
    for mut row in normalized.rows_mut() {
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        row.mapv_inplace(|v| v / (norm + EPSILON));
    }
    normalized
}

/// Unit-normalized centroid of (already row-normalized) features.
pub fn class_mean(features: &Array2<f32>) -> Array1<f32> {
    let n = features.dim().0.max(1) as f32;
    let mut mean = features.sum_axis(Axis(0)) / n;
    let norm = mean.iter().map(|v| v * v).sum::<f32>().sqrt();
    mean.mapv_inplace(|v| v / (norm + EPSILON));
    mean
}

/// Herding selection over one class's feature vectors.
///
/// `features` must be row-normalized. Maintains a running sum `S` of chosen
/// vectors; at step `k` the candidate minimizing
/// `‖target_mean − (fᵢ + S) / k‖` is selected and removed from the pool.
/// Ties break toward the lowest original index, so the procedure is
/// deterministic.
///
/// Fails with [`RehearsalError::InsufficientData`] when the pool is smaller
/// than `count_raw + count_proxy`; selection never silently truncates.
pub fn herd(
    features: &Array2<f32>,
    target_mean: &ArrayView1<f32>,
    count_raw: usize,
    count_proxy: usize,
) -> Result<SelectionSplit> {
    let total = count_raw + count_proxy;
    let available = features.dim().0;
    if total > available {
        return Err(RehearsalError::InsufficientData {
            requested: total,
            available,
        });
    }
    if features.dim().1 != target_mean.len() {
        return Err(RehearsalError::ShapeMismatch {
            expected: vec![target_mean.len()],
            got: vec![features.dim().1],
        });
    }

    let mut raw = Vec::with_capacity(count_raw);
    let mut proxy = Vec::with_capacity(count_proxy);
    let mut pool: Vec<usize> = (0..available).collect();
    let mut running_sum: Array1<f32> = Array1::zeros(target_mean.len());

    for k in 1..=total {
        let mut best_pos = 0;
        let mut best_dist = f32::INFINITY;
        for (pos, &candidate) in pool.iter().enumerate() {
            let row = features.row(candidate);
            let mut dist_sq = 0.0f32;
            for (j, target) in target_mean.iter().enumerate() {
                let mu_p = (row[j] + running_sum[j]) / k as f32;
                let diff = target - mu_p;
                dist_sq += diff * diff;
            }
            let dist = dist_sq.sqrt();
            // Strict less-than keeps the lowest index on ties
            if dist < best_dist {
                best_dist = dist;
                best_pos = pos;
            }
        }

        let chosen = pool.remove(best_pos);
        running_sum += &features.row(chosen);
        if k <= count_raw {
            raw.push(chosen);
        } else {
            proxy.push(chosen);
        }
    }

    Ok(SelectionSplit { raw, proxy })
}
