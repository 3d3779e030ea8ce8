//! C4: leaf builders and the forest-level leaf aggregator.
//!
//! Grounded on `original_source/include/forpy/leafs/` (the `forpy` C++
//! library's `ClassificationLeaf`, `RegressionLeaf`, and
//! `LinearRegressionLeaf` — the latter backed by
//! `util/regression/linearregressor.h`, whose fallback-to-constant path
//! on rank deficiency motivates `LinearLeafFallback`) and on
//! `forest_linalg::lstsq_rank_revealing` for the QR solve itself.

use forest_core::{Float, ForestError};
use serde::{Deserialize, Serialize};

use forest_linalg::lstsq_rank_revealing;

/// What a rank-deficient linear-regression leaf falls back to (spec §9
/// Open Question, resolved as an explicit config flag per §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinearLeafFallback {
    /// Degrade to a plain weighted-mean predictor for this leaf.
    MeanOnly,
    /// Propagate `ForestError::NoSolution` and let the caller decide.
    NoSolution,
}

/// Design-matrix rows and targets retained until the leaf is frozen —
/// the "support interval" the freeze rule (spec §6) refers to.
#[derive(Debug, Clone)]
struct LinearSupport<T: Float> {
    design: Vec<T>,
    targets: Vec<T>,
}

/// A fitted linear-regression leaf: a `(d+1) x k` coefficient matrix
/// (row 0 is the intercept) and a per-output residual variance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Float")]
pub struct LinearLeaf<T: Float> {
    /// Row-major `(d+1) * k`: row `c`, column `o` at `coeffs[c*k + o]`.
    pub coeffs: Vec<T>,
    pub residual_variance: Vec<T>,
    pub rank: usize,
    pub d_plus_one: usize,
    pub k: usize,
    #[serde(skip)]
    support: Option<LinearSupport<T>>,
}

impl<T: Float> LinearLeaf<T> {
    pub fn is_frozen(&self) -> bool {
        self.support.is_none()
    }

    /// Release the retained design matrix and targets. Required before
    /// serialization (spec §6 freeze rule).
    pub fn freeze(&mut self) {
        self.support = None;
    }

    pub fn predict(&self, x: &[T]) -> Vec<T> {
        let mut out = vec![T::ZERO; self.k];
        for o in 0..self.k {
            let mut acc = self.coeffs[o]; // intercept row (c=0)
            for (j, &xj) in x.iter().enumerate() {
                acc += self.coeffs[(j + 1) * self.k + o] * xj;
            }
            out[o] = acc;
        }
        out
    }
}

/// Classification leaf: weighted class-probability vector over the
/// compact code space, summing to 1 (spec §4.4).
pub fn build_classification_leaf(
    ids: &[u32],
    codes: &[u32],
    weights: Option<&[f32]>,
    n_classes: usize,
) -> Result<Vec<f64>, ForestError> {
    let mut hist = vec![0.0f64; n_classes];
    let mut total = 0.0f64;
    for &id in ids {
        let w = weights.map(|w| w[id as usize] as f64).unwrap_or(1.0);
        hist[codes[id as usize] as usize] += w;
        total += w;
    }
    if total <= 0.0 {
        return Err(ForestError::Empty);
    }
    for h in hist.iter_mut() {
        *h /= total;
    }
    Ok(hist)
}

/// Regression leaf: per-output weighted mean via Welford's incremental
/// update, with an optional per-output variance.
pub fn build_regression_leaf<T: Float>(
    ids: &[u32],
    annotations: &[T],
    k: usize,
    weights: Option<&[f32]>,
    store_variance: bool,
) -> Result<(Vec<T>, Option<Vec<T>>), ForestError> {
    if ids.is_empty() {
        return Err(ForestError::Empty);
    }
    let mut mean = vec![0.0f64; k];
    let mut m2 = vec![0.0f64; k];
    let mut total_weight = 0.0f64;

    for &id in ids {
        let w = weights.map(|w| w[id as usize] as f64).unwrap_or(1.0);
        if w <= 0.0 {
            continue;
        }
        let row = &annotations[id as usize * k..(id as usize + 1) * k];
        total_weight += w;
        for j in 0..k {
            let y = row[j].to_f64();
            let delta = y - mean[j];
            mean[j] += (w / total_weight) * delta;
            let delta2 = y - mean[j];
            m2[j] += w * delta * delta2;
        }
    }
    if total_weight <= 0.0 {
        return Err(ForestError::Empty);
    }

    let mean_t: Vec<T> = mean.iter().map(|&m| T::from_f64(m)).collect();
    let variance = if store_variance {
        Some(m2.iter().map(|&s| T::from_f64(s / total_weight)).collect())
    } else {
        None
    };
    Ok((mean_t, variance))
}

/// Outcome of attempting a linear-regression leaf: either a fit, or a
/// signal that the caller should build a plain regression leaf instead
/// (the `MeanOnly` fallback, spec §4.4).
pub enum LinearLeafOutcome<T: Float> {
    Fitted(LinearLeaf<T>),
    FallBackToMean,
}

/// Linear-regression leaf: assemble the intercept-augmented design
/// matrix over the node interval, run a rank-revealing QR, and store
/// coefficients plus residual variance. On rank deficiency that leaves
/// no usable columns, apply `fallback`.
pub fn build_linear_leaf<T: Float>(
    ids: &[u32],
    feature_column: impl Fn(usize) -> Vec<T>,
    d: usize,
    annotations: &[T],
    k: usize,
    fallback: LinearLeafFallback,
    tol: T,
) -> Result<LinearLeafOutcome<T>, ForestError> {
    let n = ids.len();
    let d_plus_one = d + 1;
    let mut design = vec![T::ZERO; n * d_plus_one];
    for row in 0..n {
        design[row * d_plus_one] = T::ONE; // intercept column
    }
    for j in 0..d {
        let col = feature_column(j);
        for (row, &id) in ids.iter().enumerate() {
            design[row * d_plus_one + j + 1] = col[id as usize];
        }
    }

    let design_tensor = forest_core::Tensor::new(design.clone(), vec![n, d_plus_one])?;

    let mut coeffs = vec![T::ZERO; d_plus_one * k];
    let mut residual_variance = vec![T::ZERO; k];
    let mut min_rank = d_plus_one;

    for o in 0..k {
        let targets: Vec<T> = ids.iter().map(|&id| annotations[id as usize * k + o]).collect();
        match lstsq_rank_revealing(&design_tensor, &targets, 0, tol) {
            Ok((col_coeffs, rank)) => {
                min_rank = min_rank.min(rank);
                for c in 0..d_plus_one {
                    coeffs[c * k + o] = col_coeffs[c];
                }
                let mut sum_sq = T::ZERO;
                for (row, &id) in ids.iter().enumerate() {
                    let mut pred = T::ZERO;
                    for c in 0..d_plus_one {
                        pred += col_coeffs[c] * design[row * d_plus_one + c];
                    }
                    let target = annotations[id as usize * k + o];
                    let resid = target - pred;
                    sum_sq += resid * resid;
                }
                residual_variance[o] = sum_sq / T::from_usize(n);
            }
            Err(ForestError::NoSolution(_)) => match fallback {
                LinearLeafFallback::MeanOnly => return Ok(LinearLeafOutcome::FallBackToMean),
                LinearLeafFallback::NoSolution => {
                    return Err(ForestError::NoSolution(format!(
                        "linear-regression leaf over {n} samples has rank 0 for output {o}"
                    )))
                }
            },
            Err(other) => return Err(other),
        }
    }

    let targets_flat: Vec<T> = ids
        .iter()
        .flat_map(|&id| annotations[id as usize * k..id as usize * k + k].to_vec())
        .collect();

    Ok(LinearLeafOutcome::Fitted(LinearLeaf {
        coeffs,
        residual_variance,
        rank: min_rank,
        d_plus_one,
        k,
        support: Some(LinearSupport { design, targets: targets_flat }),
    }))
}

/// Forest-level aggregation of per-tree classification leaf results
/// into a combined class-probability vector (spec §4.4 "Leaf
/// aggregation").
pub fn aggregate_classification(results: &[(&[f64], f32)], n_classes: usize) -> Vec<f64> {
    let mut combined = vec![0.0f64; n_classes];
    let mut total_weight = 0.0f64;
    for &(probs, weight) in results {
        let w = weight as f64;
        total_weight += w;
        for (c, &p) in probs.iter().enumerate() {
            combined[c] += w * p;
        }
    }
    if total_weight > 0.0 {
        for c in combined.iter_mut() {
            *c /= total_weight;
        }
    }
    combined
}

/// Forest-level aggregation of per-tree regression leaf results:
/// weighted-mean combination of means, and — when every tree reports a
/// variance — `E[mean^2 + variance] - E[mean]^2` for the combined
/// variance (spec §4.4).
pub fn aggregate_regression<T: Float>(
    results: &[(&[T], Option<&[T]>, f32)],
    k: usize,
) -> (Vec<T>, Option<Vec<T>>) {
    let mut combined_mean = vec![0.0f64; k];
    let mut combined_second_moment = vec![0.0f64; k];
    let mut total_weight = 0.0f64;
    let mut has_variance = true;

    for &(mean, variance, weight) in results {
        let w = weight as f64;
        total_weight += w;
        for j in 0..k {
            let m = mean[j].to_f64();
            combined_mean[j] += w * m;
            let var = match variance {
                Some(v) => v[j].to_f64(),
                None => {
                    has_variance = false;
                    0.0
                }
            };
            combined_second_moment[j] += w * (m * m + var);
        }
    }

    if total_weight <= 0.0 {
        return (vec![T::ZERO; k], None);
    }
    for j in 0..k {
        combined_mean[j] /= total_weight;
        combined_second_moment[j] /= total_weight;
    }

    let mean_t: Vec<T> = combined_mean.iter().map(|&m| T::from_f64(m)).collect();
    let variance_t = if has_variance {
        Some(
            (0..k)
                .map(|j| T::from_f64((combined_second_moment[j] - combined_mean[j] * combined_mean[j]).max(0.0)))
                .collect(),
        )
    } else {
        None
    };
    (mean_t, variance_t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_leaf_sums_to_one() {
        let ids = [0u32, 1, 2, 3];
        let codes = [0u32, 0, 1, 1];
        let probs = build_classification_leaf(&ids, &codes, None, 2).unwrap();
        let sum: f64 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!((probs[0] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn regression_leaf_mean_and_zero_variance_on_constant_targets() {
        let ids = [0u32, 1];
        let y = [10.0f64, 10.0];
        let (mean, variance) = build_regression_leaf(&ids, &y, 1, None, true).unwrap();
        assert!((mean[0] - 10.0).abs() < 1e-9);
        assert!((variance.unwrap()[0]).abs() < 1e-9);
    }

    #[test]
    fn linear_leaf_recovers_exact_line() {
        let ids = [0u32, 1, 2, 3];
        let x_col = vec![0.0f64, 1.0, 2.0, 3.0];
        let y = [2.0f64, 5.0, 8.0, 11.0]; // y = 2 + 3x
        let outcome = build_linear_leaf(
            &ids,
            |_| x_col.clone(),
            1,
            &y,
            1,
            LinearLeafFallback::MeanOnly,
            1e-7,
        )
        .unwrap();
        match outcome {
            LinearLeafOutcome::Fitted(mut leaf) => {
                assert!(!leaf.is_frozen());
                leaf.freeze();
                assert!(leaf.is_frozen());
                let pred = leaf.predict(&[4.0]);
                assert!((pred[0] - 14.0).abs() < 1e-6);
            }
            LinearLeafOutcome::FallBackToMean => panic!("expected a fitted linear leaf"),
        }
    }

    #[test]
    fn aggregate_classification_averages_equal_weight_trees() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        let combined = aggregate_classification(&[(a.as_slice(), 1.0), (b.as_slice(), 1.0)], 2);
        assert!((combined[0] - 0.5).abs() < 1e-9);
        assert!((combined[1] - 0.5).abs() < 1e-9);
    }
}
