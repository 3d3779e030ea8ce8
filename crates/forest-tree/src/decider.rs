//! C3: decider — per-node feature selection and split decision.
//!
//! Grounded on `original_source/include/forpy/deciders/` (the `forpy`
//! C++ library's `ThresholdDecider`, which owns a threshold optimizer
//! and a Fisher-Yates feature permutation per node).

use forest_core::{Float, ForestError};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::impurity::{Impurity, EPS_GAIN};
use crate::provider::{AnnotView, Provider};
use crate::threshold::{
    all_same_class, optimize_classification, optimize_regression, SplitResult, ThresholdPolicy,
    ThresholdScratch,
};

/// Decider configuration, shared (read-only) across all nodes of a tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeciderConfig {
    /// `0` means "resolve to `d` (or `sqrt(d)` if `autoscale`)".
    pub f_try: usize,
    pub autoscale: bool,
    pub gain_threshold: f64,
    pub msal: usize,
    pub policy: ThresholdPolicy,
    pub impurity: Impurity,
}

impl DeciderConfig {
    pub fn validate(&self) -> Result<(), ForestError> {
        if self.autoscale && self.f_try != 0 {
            return Err(ForestError::InvalidParam(
                "autoscale and an explicit feature-subset size are mutually exclusive".into(),
            ));
        }
        if self.gain_threshold < EPS_GAIN {
            return Err(ForestError::InvalidParam(format!(
                "gain_threshold {} is below the epsilon floor {EPS_GAIN}", self.gain_threshold
            )));
        }
        if self.msal == 0 {
            return Err(ForestError::InvalidParam("min_samples_at_leaf must be >= 1".into()));
        }
        Ok(())
    }

    fn resolve_f_try(&self, d: usize) -> usize {
        if self.f_try != 0 {
            self.f_try.min(d)
        } else if self.autoscale {
            ((d as f64).sqrt().ceil() as usize).clamp(1, d)
        } else {
            d
        }
    }
}

/// What `make_node` decided for one work item.
pub enum NodeOutcome<T: Float> {
    Leaf,
    Split { feature: usize, threshold: T, split_count: usize },
}

/// Decide the fate of one node: leaf, or split into two children.
///
/// `ids` is the node's `[lo, hi)` subrange; on a `Split` outcome it is
/// left partitioned in place so `ids[..split_count]` is the left child
/// and the remainder the right child. `known_invalid` is inherited from
/// the node's ancestors and updated here with any newly discovered
/// useless features, then handed unchanged to both children by the
/// caller (spec §4.3: "known-invalid ... for the node's descendants in
/// that tree").
#[allow(clippy::too_many_arguments)]
pub fn make_node<T: Float, R: Rng>(
    cfg: &DeciderConfig,
    provider: &Provider<T>,
    ids: &mut [u32],
    known_invalid: &mut [bool],
    scratch: &mut ThresholdScratch<T>,
    rng: &mut R,
) -> Result<NodeOutcome<T>, ForestError> {
    let d = provider.feat_dim();
    if known_invalid.len() != d {
        return Err(ForestError::Internal(format!(
            "known_invalid length {} does not match provider feat_dim {d}", known_invalid.len()
        )));
    }
    let f_try = cfg.resolve_f_try(d);

    match provider.annotations() {
        AnnotView::Classification { codes, .. } => {
            if all_same_class(ids, codes) {
                return Ok(NodeOutcome::Leaf);
            }
        }
        AnnotView::Regression { .. } => {}
    }

    let weights = provider.weights();

    let mut candidates: Vec<usize> = (0..d).filter(|&j| !known_invalid[j]).collect();
    fisher_yates_shuffle(&mut candidates, rng);

    let mut best: Option<(usize, SplitResult<T>, Vec<u32>)> = None;
    let mut valid_attempts = 0usize;

    for &j in &candidates {
        if valid_attempts >= f_try {
            break;
        }
        let mut trial = ids.to_vec();
        let result = match provider.annotations() {
            AnnotView::Classification { codes, n_classes } => optimize_classification(
                &mut trial,
                provider.feature_column(j),
                codes,
                weights,
                n_classes,
                cfg.impurity,
                cfg.policy,
                cfg.msal,
                EPS_GAIN,
                false,
                scratch,
                rng,
            ),
            AnnotView::Regression { data, k } => optimize_regression(
                &mut trial,
                provider.feature_column(j),
                data,
                k,
                weights,
                cfg.policy,
                cfg.msal,
                EPS_GAIN,
                false,
                scratch,
                rng,
            ),
        };

        if !result.valid {
            known_invalid[j] = true;
            continue;
        }
        valid_attempts += 1;

        let is_better = match &best {
            None => true,
            Some((_, current, _)) => result.gain > current.gain,
        };
        if is_better {
            best = Some((j, result, trial));
        }
    }

    match best {
        None => Ok(NodeOutcome::Leaf),
        Some((feature, split, order)) => {
            let right_count = order.len() - split.split_count;
            if split.gain < cfg.gain_threshold
                || split.split_count < cfg.msal
                || right_count < cfg.msal
            {
                Ok(NodeOutcome::Leaf)
            } else {
                ids.copy_from_slice(&order);
                Ok(NodeOutcome::Split {
                    feature,
                    threshold: split.threshold,
                    split_count: split.split_count,
                })
            }
        }
    }
}

/// `x[feat_sel] <= thresh` routes left, else right (spec §4.3 `decide`).
pub fn decide<T: Float>(feature_value: T, threshold: T) -> bool {
    feature_value <= threshold
}

fn fisher_yates_shuffle<R: Rng>(items: &mut [usize], rng: &mut R) {
    for i in (1..items.len()).rev() {
        let j = rng.gen_range(0..=i);
        items.swap(i, j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forest_core::Tensor;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn classification_provider() -> Provider<f64> {
        let x: Tensor<f64> =
            Tensor::from_vec2d(&[vec![0.0], vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let y: Tensor<f64> = Tensor::from_vec2d(&[vec![0.0], vec![0.0], vec![1.0], vec![1.0]]).unwrap();
        let annot = crate::provider::Annotations::compact_classification(&y).unwrap();
        Provider::root(&x, annot, None).unwrap()
    }

    #[test]
    fn separable_data_splits_at_midpoint() {
        let provider = classification_provider();
        let cfg = DeciderConfig {
            f_try: 0,
            autoscale: false,
            gain_threshold: EPS_GAIN,
            msal: 1,
            policy: ThresholdPolicy::Exact,
            impurity: Impurity::Induced(2.0),
        };
        cfg.validate().unwrap();
        let mut ids: Vec<u32> = provider.initial_sample_list().to_vec();
        let mut known_invalid = vec![false; provider.feat_dim()];
        let mut scratch = ThresholdScratch::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let outcome =
            make_node(&cfg, &provider, &mut ids, &mut known_invalid, &mut scratch, &mut rng).unwrap();
        match outcome {
            NodeOutcome::Split { feature, threshold, split_count } => {
                assert_eq!(feature, 0);
                assert!((threshold - 1.5).abs() < 1e-9);
                assert_eq!(split_count, 2);
            }
            NodeOutcome::Leaf => panic!("expected a split"),
        }
    }

    #[test]
    fn pure_node_is_a_leaf() {
        let x: Tensor<f64> = Tensor::from_vec2d(&[vec![0.0], vec![1.0]]).unwrap();
        let y: Tensor<f64> = Tensor::from_vec2d(&[vec![1.0], vec![1.0]]).unwrap();
        let annot = crate::provider::Annotations::compact_classification(&y).unwrap();
        let provider = Provider::root(&x, annot, None).unwrap();
        let cfg = DeciderConfig {
            f_try: 0,
            autoscale: false,
            gain_threshold: EPS_GAIN,
            msal: 1,
            policy: ThresholdPolicy::Exact,
            impurity: Impurity::Shannon,
        };
        let mut ids: Vec<u32> = provider.initial_sample_list().to_vec();
        let mut known_invalid = vec![false; provider.feat_dim()];
        let mut scratch = ThresholdScratch::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let outcome =
            make_node(&cfg, &provider, &mut ids, &mut known_invalid, &mut scratch, &mut rng).unwrap();
        assert!(matches!(outcome, NodeOutcome::Leaf));
    }

    #[test]
    fn constant_feature_becomes_known_invalid() {
        let x: Tensor<f64> = Tensor::from_vec2d(&[vec![5.0], vec![5.0], vec![5.0], vec![5.0]]).unwrap();
        let y: Tensor<f64> = Tensor::from_vec2d(&[vec![0.0], vec![0.0], vec![1.0], vec![1.0]]).unwrap();
        let annot = crate::provider::Annotations::compact_classification(&y).unwrap();
        let provider = Provider::root(&x, annot, None).unwrap();
        let cfg = DeciderConfig {
            f_try: 0,
            autoscale: false,
            gain_threshold: EPS_GAIN,
            msal: 1,
            policy: ThresholdPolicy::Exact,
            impurity: Impurity::Shannon,
        };
        let mut ids: Vec<u32> = provider.initial_sample_list().to_vec();
        let mut known_invalid = vec![false; provider.feat_dim()];
        let mut scratch = ThresholdScratch::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let outcome =
            make_node(&cfg, &provider, &mut ids, &mut known_invalid, &mut scratch, &mut rng).unwrap();
        assert!(matches!(outcome, NodeOutcome::Leaf));
        assert!(known_invalid[0]);
    }
}
