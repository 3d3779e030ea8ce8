//! C2: per-feature threshold optimizer.
//!
//! Given a node's sample-ID subrange and one feature column, finds the
//! best `x <= threshold` split under a configured impurity criterion.
//! Grounded on `original_source/include/forpy/threshold_optimizers/` (the
//! `forpy` C++ library's single-pass classification/regression
//! optimizers), reshaped around a reusable scratch buffer instead of the
//! source's per-call heap allocation.

use forest_core::Float;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::impurity::{Impurity, EPS_FEAT, EPS_GAIN};

/// Above this many samples, the Gini fast path resets its running
/// sum-of-squares from the histogram directly rather than trusting
/// accumulated incremental updates (spec §4.2, §9: bound rounding error
/// on long incremental accumulations).
const RECOMPUTE_INTERVAL: usize = 5000;

/// Threshold search policy for a node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ThresholdPolicy {
    /// Try every valid split position.
    Exact,
    /// Try at most `m` randomly drawn thresholds.
    Random(usize),
}

/// Outcome of a threshold search over one feature column.
#[derive(Debug, Clone)]
pub struct SplitResult<T: Float> {
    pub valid: bool,
    /// Count of samples routed left (`ids[lo..lo+split_count]`), meaningful
    /// only when `valid`.
    pub split_count: usize,
    pub threshold: T,
    pub gain: f64,
}

impl<T: Float> SplitResult<T> {
    fn invalid() -> Self {
        SplitResult { valid: false, split_count: 0, threshold: T::ZERO, gain: f64::NEG_INFINITY }
    }
}

/// Reusable per-worker scratch for one threshold search. Held inside the
/// pool's per-worker "desk" (see `pool::Desk`) and cleared, not
/// reallocated, between work items.
#[derive(Debug, Default)]
pub struct ThresholdScratch<T: Float> {
    pairs: Vec<(T, u32)>,
    left_hist: Vec<f64>,
    right_hist: Vec<f64>,
    random_thresholds: Vec<T>,
    left_sum: Vec<f64>,
    right_sum: Vec<f64>,
}

impl<T: Float> ThresholdScratch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_hist_capacity(&mut self, n_classes: usize) {
        self.left_hist.clear();
        self.left_hist.resize(n_classes, 0.0);
        self.right_hist.clear();
        self.right_hist.resize(n_classes, 0.0);
    }

    fn ensure_k_capacity(&mut self, k: usize) {
        self.left_sum.clear();
        self.left_sum.resize(k, 0.0);
        self.right_sum.clear();
        self.right_sum.resize(k, 0.0);
    }
}

/// Sort `ids` (a node's `[lo, hi)` subrange, given here as a plain slice
/// already sliced to that subrange) by their feature value, filling
/// `scratch.pairs` as working storage. Returns `(min, max)`.
fn sort_by_feature<T: Float>(
    ids: &mut [u32],
    feature: &[T],
    scratch: &mut ThresholdScratch<T>,
    already_sorted: bool,
) -> (T, T) {
    if already_sorted {
        let min = feature[ids[0] as usize];
        let max = feature[ids[ids.len() - 1] as usize];
        return (min, max);
    }
    scratch.pairs.clear();
    scratch.pairs.extend(ids.iter().map(|&id| (feature[id as usize], id)));
    scratch
        .pairs
        .sort_by(|a, b| a.0.to_f64().partial_cmp(&b.0.to_f64()).unwrap());
    for (slot, &(_, id)) in ids.iter_mut().zip(scratch.pairs.iter()) {
        *slot = id;
    }
    let min = scratch.pairs[0].0;
    let max = scratch.pairs[scratch.pairs.len() - 1].0;
    (min, max)
}

/// Midpoint threshold between two straddling feature values, falling
/// back to the smaller value if rounding collapses the midpoint onto
/// the larger one (spec §4.2 step 7).
fn straddling_threshold<T: Float>(lower: T, upper: T) -> T {
    let mid = lower + (upper - lower) * T::HALF;
    if mid >= upper {
        lower
    } else {
        mid
    }
}

/// Candidate split positions (counts of samples routed left) to examine,
/// given the policy and the node's sorted values.
fn candidate_positions<T: Float>(
    values: &[T],
    min: T,
    max: T,
    msal: usize,
    policy: ThresholdPolicy,
    scratch: &mut ThresholdScratch<T>,
    rng: &mut impl Rng,
) -> Vec<usize> {
    let len = values.len();
    if len < 2 * msal {
        return Vec::new();
    }
    match policy {
        ThresholdPolicy::Exact => (msal..=(len - msal)).collect(),
        ThresholdPolicy::Random(m) => {
            let span = (max.to_f64() - min.to_f64()).max(EPS_FEAT);
            let cap = ((span / EPS_FEAT).ceil() as usize).max(1);
            let draws = m.min(len).min(cap).max(1);
            scratch.random_thresholds.clear();
            for _ in 0..draws {
                let t = rng.gen_range(min.to_f64()..=max.to_f64());
                scratch.random_thresholds.push(T::from_f64(t));
            }
            scratch
                .random_thresholds
                .sort_by(|a, b| a.to_f64().partial_cmp(&b.to_f64()).unwrap());
            let mut positions = Vec::with_capacity(draws);
            let mut idx = 0usize;
            for &t in &scratch.random_thresholds {
                while idx < len && values[idx].to_f64() <= t.to_f64() {
                    idx += 1;
                }
                let pos = idx.clamp(msal, len - msal);
                positions.push(pos);
            }
            positions.sort_unstable();
            positions.dedup();
            positions
        }
    }
}

/// Classification threshold search over one feature column.
///
/// `ids` must already be restricted to the node's `[lo, hi)` subrange
/// (the caller owns the interval slicing; this function only sorts and
/// reads within it). `codes` and `weights` are indexed by sample id
/// (length `n`, not `hi - lo`).
#[allow(clippy::too_many_arguments)]
pub fn optimize_classification<T: Float>(
    ids: &mut [u32],
    feature: &[T],
    codes: &[u32],
    weights: Option<&[f32]>,
    n_classes: usize,
    impurity: Impurity,
    policy: ThresholdPolicy,
    msal: usize,
    eps_gain: f64,
    already_sorted: bool,
    scratch: &mut ThresholdScratch<T>,
    rng: &mut impl Rng,
) -> SplitResult<T> {
    let len = ids.len();
    if len < 2 * msal {
        return SplitResult::invalid();
    }

    let (min, max) = sort_by_feature(ids, feature, scratch, already_sorted);
    if max.to_f64() - min.to_f64() <= EPS_FEAT {
        return SplitResult::invalid();
    }

    let weight_of = |id: u32| -> f64 {
        weights.map(|w| w[id as usize] as f64).unwrap_or(1.0)
    };

    scratch.ensure_hist_capacity(n_classes);
    let mut total_weight = 0.0;
    for &id in ids.iter() {
        let w = weight_of(id);
        scratch.right_hist[codes[id as usize] as usize] += w;
        total_weight += w;
    }
    if total_weight <= 0.0 {
        return SplitResult::invalid();
    }
    let full_impurity = impurity.evaluate(&scratch.right_hist, total_weight);

    let values: Vec<T> = ids.iter().map(|&id| feature[id as usize]).collect();
    let positions = candidate_positions(&values, min, max, msal, policy, scratch, rng);
    if positions.is_empty() {
        return SplitResult::invalid();
    }

    let is_gini = matches!(impurity, Impurity::Induced(p) if (p - 2.0).abs() < EPS_FEAT);
    let mut sum_sq_left = 0.0f64;
    let mut sum_sq_right: f64 = scratch.right_hist.iter().map(|c| c * c).sum();
    let mut left_weight = 0.0f64;
    let mut right_weight = total_weight;

    let mut best = SplitResult::invalid();
    let mut pos_iter = positions.iter().copied().peekable();
    let mut p = 0usize;
    let mut since_recompute = 0usize;
    while let Some(&target) = pos_iter.peek() {
        while p < target {
            let id = ids[p];
            let c = codes[id as usize] as usize;
            let w = weight_of(id);
            if is_gini {
                sum_sq_left += w * (2.0 * scratch.left_hist[c] + w);
                sum_sq_right -= w * (2.0 * scratch.right_hist[c] - w);
            }
            scratch.left_hist[c] += w;
            scratch.right_hist[c] -= w;
            left_weight += w;
            right_weight -= w;
            p += 1;
            since_recompute += 1;
        }
        pos_iter.next();

        if since_recompute >= RECOMPUTE_INTERVAL {
            sum_sq_left = scratch.left_hist.iter().map(|c| c * c).sum();
            sum_sq_right = scratch.right_hist.iter().map(|c| c * c).sum();
            since_recompute = 0;
        }

        if p == 0 || p == len {
            continue;
        }
        // Reject positions that don't actually separate distinct values.
        if (values[p].to_f64() - values[p - 1].to_f64()).abs() <= EPS_FEAT {
            continue;
        }
        if left_weight <= 0.0 || right_weight <= 0.0 {
            continue;
        }

        let (h_left, h_right) = if is_gini {
            (1.0 - sum_sq_left / (left_weight * left_weight),
             1.0 - sum_sq_right / (right_weight * right_weight))
        } else {
            (impurity.evaluate(&scratch.left_hist, left_weight),
             impurity.evaluate(&scratch.right_hist, right_weight))
        };
        let gain = full_impurity
            - (left_weight / total_weight) * h_left
            - (right_weight / total_weight) * h_right;

        if gain > best.gain + eps_gain.max(EPS_GAIN) {
            best = SplitResult {
                valid: true,
                split_count: p,
                threshold: straddling_threshold(values[p - 1], values[p]),
                gain,
            };
        }
    }

    best
}

/// Regression threshold search over one feature column. `annotations`
/// is `n * k` row-major real values (row `i` at `annotations[i*k..(i+1)*k]`).
#[allow(clippy::too_many_arguments)]
pub fn optimize_regression<T: Float>(
    ids: &mut [u32],
    feature: &[T],
    annotations: &[T],
    k: usize,
    weights: Option<&[f32]>,
    policy: ThresholdPolicy,
    msal: usize,
    eps_gain: f64,
    already_sorted: bool,
    scratch: &mut ThresholdScratch<T>,
    rng: &mut impl Rng,
) -> SplitResult<T> {
    let len = ids.len();
    if len < 2 * msal {
        return SplitResult::invalid();
    }

    let (min, max) = sort_by_feature(ids, feature, scratch, already_sorted);
    if max.to_f64() - min.to_f64() <= EPS_FEAT {
        return SplitResult::invalid();
    }

    let weight_of = |id: u32| -> f64 {
        weights.map(|w| w[id as usize] as f64).unwrap_or(1.0)
    };
    let row = |id: u32| -> &[T] {
        let i = id as usize;
        &annotations[i * k..(i + 1) * k]
    };

    scratch.ensure_k_capacity(k);
    let mut total_weight = 0.0f64;
    for &id in ids.iter() {
        let w = weight_of(id);
        for (j, &y) in row(id).iter().enumerate() {
            scratch.right_sum[j] += w * y.to_f64();
        }
        total_weight += w;
    }
    if total_weight <= 0.0 {
        return SplitResult::invalid();
    }
    let full_sum_sq: f64 = scratch.right_sum.iter().map(|s| s * s).sum::<f64>() / (total_weight * total_weight);

    let values: Vec<T> = ids.iter().map(|&id| feature[id as usize]).collect();
    let positions = candidate_positions(&values, min, max, msal, policy, scratch, rng);
    if positions.is_empty() {
        return SplitResult::invalid();
    }

    let mut left_weight = 0.0f64;
    let mut right_weight = total_weight;

    let mut best = SplitResult::invalid();
    let mut pos_iter = positions.iter().copied().peekable();
    let mut p = 0usize;
    while let Some(&target) = pos_iter.peek() {
        while p < target {
            let id = ids[p];
            let w = weight_of(id);
            for (j, &y) in row(id).iter().enumerate() {
                scratch.left_sum[j] += w * y.to_f64();
                scratch.right_sum[j] -= w * y.to_f64();
            }
            left_weight += w;
            right_weight -= w;
            p += 1;
        }
        pos_iter.next();

        if p == 0 || p == len {
            continue;
        }
        if (values[p].to_f64() - values[p - 1].to_f64()).abs() <= EPS_FEAT {
            continue;
        }
        if left_weight <= 0.0 || right_weight <= 0.0 {
            continue;
        }

        let norm_left: f64 = scratch.left_sum.iter().map(|s| s * s).sum::<f64>() / left_weight;
        let norm_right: f64 = scratch.right_sum.iter().map(|s| s * s).sum::<f64>() / right_weight;
        let norm_full = full_sum_sq * total_weight;
        let gain = norm_left + norm_right - norm_full;

        if gain > best.gain + eps_gain.max(EPS_GAIN) {
            best = SplitResult {
                valid: true,
                split_count: p,
                threshold: straddling_threshold(values[p - 1], values[p]),
                gain,
            };
        }
    }

    best
}

/// Cheap pre-scan: true if every sample in `ids` carries the same class
/// code (spec §4.2 "early stop").
pub fn all_same_class(ids: &[u32], codes: &[u32]) -> bool {
    match ids.first() {
        None => true,
        Some(&first) => ids.iter().all(|&id| codes[id as usize] == codes[first as usize]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn separable_two_class_split_at_midpoint() {
        let feature = [0.0f64, 1.0, 2.0, 3.0];
        let codes = [0u32, 0, 1, 1];
        let mut ids = [0u32, 1, 2, 3];
        let mut scratch = ThresholdScratch::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let result = optimize_classification(
            &mut ids,
            &feature,
            &codes,
            None,
            2,
            Impurity::Induced(2.0),
            ThresholdPolicy::Exact,
            1,
            EPS_GAIN,
            false,
            &mut scratch,
            &mut rng,
        );
        assert!(result.valid);
        assert_eq!(result.split_count, 2);
        assert!((result.threshold - 1.5).abs() < 1e-9);
    }

    #[test]
    fn constant_feature_is_invalid() {
        let feature = [5.0f64, 5.0, 5.0, 5.0];
        let codes = [0u32, 0, 1, 1];
        let mut ids = [0u32, 1, 2, 3];
        let mut scratch = ThresholdScratch::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let result = optimize_classification(
            &mut ids,
            &feature,
            &codes,
            None,
            2,
            Impurity::Shannon,
            ThresholdPolicy::Exact,
            1,
            EPS_GAIN,
            false,
            &mut scratch,
            &mut rng,
        );
        assert!(!result.valid);
    }

    #[test]
    fn regression_split_separates_means() {
        let feature = [0.0f64, 1.0, 2.0, 3.0];
        let y = [10.0f64, 10.0, 20.0, 20.0];
        let mut ids = [0u32, 1, 2, 3];
        let mut scratch = ThresholdScratch::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let result = optimize_regression(
            &mut ids,
            &feature,
            &y,
            1,
            None,
            ThresholdPolicy::Exact,
            1,
            EPS_GAIN,
            false,
            &mut scratch,
            &mut rng,
        );
        assert!(result.valid);
        assert_eq!(result.split_count, 2);
        assert!((result.threshold - 1.5).abs() < 1e-9);
    }

    #[test]
    fn all_same_class_detects_pure_node() {
        let codes = [2u32, 2, 2];
        let ids = [0u32, 1, 2];
        assert!(all_same_class(&ids, &codes));
        let codes2 = [2u32, 3, 2];
        assert!(!all_same_class(&ids, &codes2));
    }
}
