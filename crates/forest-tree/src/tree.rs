//! C6: tree — node table, DFS growth, and traversal.
//!
//! Grounded on `original_source/include/forpy/tree.h` (the `forpy` C++
//! library's growth loop and flat node table), reshaped around a
//! half-open sample-ID interval buffer instead of pointer-linked sample
//! lists (spec §9 design note).

use std::sync::atomic::{AtomicU32, Ordering};

use forest_core::{Float, ForestError};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::decider::{decide, make_node, DeciderConfig, NodeOutcome};
use crate::leaf::{
    aggregate_classification, aggregate_regression, build_classification_leaf,
    build_linear_leaf, build_regression_leaf, LinearLeaf, LinearLeafFallback, LinearLeafOutcome,
};
use crate::provider::{AnnotView, Provider};
use crate::threshold::ThresholdScratch;

/// One node's children. `left == right == 0` only ever holds for the
/// unallocated placeholder at growth time; whether a given id is a
/// leaf is determined by membership in `Tree::leaves`, never by this
/// pair alone (root id 0 would otherwise collide with "no children" —
/// see the resolved ambiguity in the design notes).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeRecord {
    pub left: u32,
    pub right: u32,
}

/// What kind of predictor terminal nodes build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LeafKind {
    Classification { n_classes: usize },
    Regression { k: usize, store_variance: bool },
    LinearRegression { k: usize, fallback: LinearLeafFallback, tol: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Float")]
pub enum LeafRecord<T: Float> {
    Classification(Vec<f64>),
    Regression { mean: Vec<T>, variance: Option<Vec<T>> },
    Linear(LinearLeaf<T>),
}

/// Per-tree growth parameters; shared, read-only once `fit` starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    pub max_depth: usize,
    pub msal: usize,
    pub msan: usize,
    pub decider: DeciderConfig,
    pub leaf_kind: LeafKind,
}

impl TreeConfig {
    pub fn validate(&self) -> Result<(), ForestError> {
        if self.max_depth == 0 {
            return Err(ForestError::InvalidParam("max_depth must be >= 1".into()));
        }
        if self.msal == 0 {
            return Err(ForestError::InvalidParam("msal must be >= 1".into()));
        }
        if self.msan < 2 * self.msal {
            return Err(ForestError::InvalidParam(format!(
                "msan ({}) must be >= 2 * msal ({})", self.msan, self.msal
            )));
        }
        self.decider.validate()
    }
}

struct WorkItem {
    lo: usize,
    hi: usize,
    node_id: u32,
    depth: usize,
    known_invalid: Vec<bool>,
}

/// A flattened `(feat, thresh, left, right)` table for cache-friendly
/// traversal; a leaf is encoded by `left == right` holding the node's
/// own id, which indexes `Tree::leaves` directly (spec §4.7
/// `enable_fast_prediction`).
#[derive(Debug, Clone)]
struct FastTree<T: Float> {
    feat: Vec<u32>,
    thresh: Vec<T>,
    left: Vec<u32>,
    right: Vec<u32>,
}

/// One decision tree: a pre-allocated node table grown by exactly one
/// worker via single-threaded DFS (spec §4.6).
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound = "T: Float")]
pub struct Tree<T: Float> {
    pub config: TreeConfig,
    /// Combination weight used when aggregating this tree's
    /// predictions at the forest level (spec §6 persisted state); not
    /// to be confused with the per-sample bootstrap weights used
    /// during growth, which are owned by the provider and discarded
    /// after fit.
    pub weight: f64,
    nodes: Vec<NodeRecord>,
    feat_sel: Vec<u32>,
    thresh: Vec<T>,
    leaves: Vec<Option<LeafRecord<T>>>,
    #[serde(skip)]
    next_id: AtomicU32,
    #[serde(skip)]
    fast: Option<FastTree<T>>,
    max_depth_reached: usize,
}

impl<T: Float> Tree<T> {
    pub fn new(config: TreeConfig) -> Result<Self, ForestError> {
        config.validate()?;
        Ok(Tree {
            config,
            weight: 1.0,
            nodes: vec![NodeRecord::default()],
            feat_sel: vec![0],
            thresh: vec![T::ZERO],
            leaves: vec![None],
            next_id: AtomicU32::new(1),
            fast: None,
            max_depth_reached: 0,
        })
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn depth(&self) -> usize {
        self.max_depth_reached
    }

    fn alloc_node(&mut self) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.nodes.push(NodeRecord::default());
        self.feat_sel.push(0);
        self.thresh.push(T::ZERO);
        self.leaves.push(None);
        id
    }

    /// Grow the tree from the provider's initial sample-id list.
    pub fn fit<R: Rng>(
        &mut self,
        provider: &Provider<T>,
        scratch: &mut ThresholdScratch<T>,
        rng: &mut R,
    ) -> Result<(), ForestError> {
        let mut ids: Vec<u32> = provider.initial_sample_list().to_vec();
        let n = ids.len();
        if n == 0 {
            return Err(ForestError::Empty);
        }
        let d = provider.feat_dim();

        let mut stack = vec![WorkItem { lo: 0, hi: n, node_id: 0, depth: 0, known_invalid: vec![false; d] }];

        while let Some(item) = stack.pop() {
            self.max_depth_reached = self.max_depth_reached.max(item.depth);
            let size = item.hi - item.lo;
            let forced_leaf = size < self.config.msan || item.depth >= self.config.max_depth;

            let mut known_invalid = item.known_invalid.clone();
            let outcome = if forced_leaf {
                NodeOutcome::Leaf
            } else {
                make_node(
                    &self.config.decider,
                    provider,
                    &mut ids[item.lo..item.hi],
                    &mut known_invalid,
                    scratch,
                    rng,
                )?
            };

            match outcome {
                NodeOutcome::Leaf => {
                    let record = self.build_leaf(provider, &ids[item.lo..item.hi])?;
                    self.leaves[item.node_id as usize] = Some(record);
                }
                NodeOutcome::Split { feature, threshold, split_count } => {
                    let mid = item.lo + split_count;
                    let left_id = self.alloc_node();
                    let right_id = self.alloc_node();
                    self.nodes[item.node_id as usize] = NodeRecord { left: left_id, right: right_id };
                    self.feat_sel[item.node_id as usize] = feature as u32;
                    self.thresh[item.node_id as usize] = threshold;

                    // `known_invalid` now carries every feature `make_node`
                    // proved useless at this node, in addition to what it
                    // inherited from the parent; both children inherit it.
                    stack.push(WorkItem { lo: mid, hi: item.hi, node_id: right_id, depth: item.depth + 1, known_invalid: known_invalid.clone() });
                    stack.push(WorkItem { lo: item.lo, hi: mid, node_id: left_id, depth: item.depth + 1, known_invalid });
                }
            }
        }
        Ok(())
    }

    fn build_leaf(&self, provider: &Provider<T>, ids: &[u32]) -> Result<LeafRecord<T>, ForestError> {
        let weights = provider.weights();
        match (&self.config.leaf_kind, provider.annotations()) {
            (LeafKind::Classification { n_classes }, AnnotView::Classification { codes, .. }) => {
                let probs = build_classification_leaf(ids, codes, weights, *n_classes)?;
                Ok(LeafRecord::Classification(probs))
            }
            (LeafKind::Regression { k, store_variance }, AnnotView::Regression { data, .. }) => {
                let (mean, variance) = build_regression_leaf(ids, data, *k, weights, *store_variance)?;
                Ok(LeafRecord::Regression { mean, variance })
            }
            (LeafKind::LinearRegression { k, fallback, tol }, AnnotView::Regression { data, .. }) => {
                let d = provider.feat_dim();
                let outcome = build_linear_leaf(
                    ids,
                    |j| provider.feature_column(j).to_vec(),
                    d,
                    data,
                    *k,
                    *fallback,
                    T::from_f64(*tol),
                )?;
                match outcome {
                    LinearLeafOutcome::Fitted(mut leaf) => {
                        leaf.freeze();
                        Ok(LeafRecord::Linear(leaf))
                    }
                    LinearLeafOutcome::FallBackToMean => {
                        let (mean, variance) = build_regression_leaf(ids, data, *k, weights, true)?;
                        Ok(LeafRecord::Regression { mean, variance })
                    }
                }
            }
            _ => Err(ForestError::Internal("leaf kind does not match provider annotation kind".into())),
        }
    }

    /// Walk from the root using the growth-time node table, returning
    /// the terminal node id.
    pub fn predict_leaf(&self, x: &[T]) -> Result<u32, ForestError> {
        let mut current = 0u32;
        loop {
            if self.leaves[current as usize].is_some() {
                return Ok(current);
            }
            let node = self.nodes[current as usize];
            let feat = self.feat_sel[current as usize] as usize;
            let thresh = self.thresh[current as usize];
            current = if decide(x[feat], thresh) { node.left } else { node.right };
        }
    }

    pub fn leaf(&self, node_id: u32) -> Option<&LeafRecord<T>> {
        self.leaves[node_id as usize].as_ref()
    }

    /// All of this tree's leaf records, in node-id order. Used by the
    /// serialization layer to check the linear-regression freeze rule
    /// before a model is saved.
    pub fn leaves(&self) -> impl Iterator<Item = &LeafRecord<T>> {
        self.leaves.iter().filter_map(|l| l.as_ref())
    }

    /// Precompute a flat `(feat, thresh, left, right)` table for
    /// cache-friendlier traversal (spec §4.7).
    pub fn enable_fast_prediction(&mut self) {
        let n = self.nodes.len();
        let mut feat = vec![0u32; n];
        let mut thresh = vec![T::ZERO; n];
        let mut left = vec![0u32; n];
        let mut right = vec![0u32; n];
        for id in 0..n {
            if self.leaves[id].is_some() {
                left[id] = id as u32;
                right[id] = id as u32;
            } else {
                feat[id] = self.feat_sel[id];
                thresh[id] = self.thresh[id];
                left[id] = self.nodes[id].left;
                right[id] = self.nodes[id].right;
            }
        }
        self.fast = Some(FastTree { feat, thresh, left, right });
    }

    pub fn predict_leaf_fast(&self, x: &[T]) -> Result<u32, ForestError> {
        let fast = self
            .fast
            .as_ref()
            .ok_or_else(|| ForestError::NotInitialized("enable_fast_prediction was not called".into()))?;
        let mut current = 0usize;
        loop {
            let l = fast.left[current];
            let r = fast.right[current];
            if l == r {
                return Ok(l);
            }
            current = if decide(x[fast.feat[current] as usize], fast.thresh[current]) {
                l as usize
            } else {
                r as usize
            };
        }
    }
}

/// Combine one row's per-tree leaf results into a forest prediction
/// (spec §4.4 "Leaf aggregation", §4.7 `predict`).
pub fn aggregate_leaves<'a, T: Float>(
    records: &[(&'a LeafRecord<T>, f64)],
    n_classes: Option<usize>,
    k: Option<usize>,
) -> Result<LeafRecord<T>, ForestError> {
    if let Some(n_classes) = n_classes {
        let pairs: Vec<(&[f64], f32)> = records
            .iter()
            .map(|(r, w)| match r {
                LeafRecord::Classification(probs) => Ok((probs.as_slice(), *w as f32)),
                _ => Err(ForestError::Internal("mixed leaf kinds during aggregation".into())),
            })
            .collect::<Result<_, ForestError>>()?;
        return Ok(LeafRecord::Classification(aggregate_classification(&pairs, n_classes)));
    }
    let k = k.ok_or_else(|| ForestError::Internal("aggregate_leaves needs n_classes or k".into()))?;
    let mut triples: Vec<(&[T], Option<&[T]>, f32)> = Vec::with_capacity(records.len());
    for (r, w) in records {
        match r {
            LeafRecord::Regression { mean, variance } => {
                triples.push((mean.as_slice(), variance.as_deref(), *w as f32))
            }
            LeafRecord::Linear(_leaf) => {
                // A linear leaf's point prediction already happened at
                // the caller (it needs `x`, not just the stored leaf);
                // this path only combines already-resolved mean/variance
                // pairs, so linear leaves must be resolved to a
                // `Regression` record by the caller before aggregation.
                return Err(ForestError::Internal(
                    "linear-regression leaves must be resolved to point predictions before aggregation".into(),
                ));
            }
            _ => return Err(ForestError::Internal("mixed leaf kinds during aggregation".into())),
        }
    }
    let (mean, variance) = aggregate_regression(&triples, k);
    Ok(LeafRecord::Regression { mean, variance })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impurity::Impurity;
    use crate::provider::Annotations;
    use crate::threshold::ThresholdPolicy;
    use forest_core::Tensor;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn two_class_config() -> TreeConfig {
        TreeConfig {
            max_depth: 2,
            msal: 1,
            msan: 2,
            decider: DeciderConfig {
                f_try: 0,
                autoscale: false,
                gain_threshold: 1e-7,
                msal: 1,
                policy: ThresholdPolicy::Exact,
                impurity: Impurity::Induced(2.0),
            },
            leaf_kind: LeafKind::Classification { n_classes: 2 },
        }
    }

    #[test]
    fn grows_single_split_tree_on_separable_data() {
        let x: Tensor<f64> = Tensor::from_vec2d(&[vec![0.0], vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let y: Tensor<f64> = Tensor::from_vec2d(&[vec![0.0], vec![0.0], vec![1.0], vec![1.0]]).unwrap();
        let annot = Annotations::compact_classification(&y).unwrap();
        let provider = Provider::root(&x, annot, None).unwrap();

        let mut tree = Tree::new(two_class_config()).unwrap();
        let mut scratch = ThresholdScratch::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        tree.fit(&provider, &mut scratch, &mut rng).unwrap();

        assert_eq!(tree.n_nodes(), 3);
        let leaf_left = tree.predict_leaf(&[0.0]).unwrap();
        let leaf_right = tree.predict_leaf(&[3.0]).unwrap();
        assert_ne!(leaf_left, leaf_right);
        match tree.leaf(leaf_left).unwrap() {
            LeafRecord::Classification(probs) => assert!((probs[0] - 1.0).abs() < 1e-9),
            _ => panic!("expected classification leaf"),
        }
    }

    #[test]
    fn fast_prediction_matches_slow_traversal() {
        let x: Tensor<f64> = Tensor::from_vec2d(&[vec![0.0], vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let y: Tensor<f64> = Tensor::from_vec2d(&[vec![0.0], vec![0.0], vec![1.0], vec![1.0]]).unwrap();
        let annot = Annotations::compact_classification(&y).unwrap();
        let provider = Provider::root(&x, annot, None).unwrap();

        let mut tree = Tree::new(two_class_config()).unwrap();
        let mut scratch = ThresholdScratch::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        tree.fit(&provider, &mut scratch, &mut rng).unwrap();
        tree.enable_fast_prediction();

        for &v in &[0.0, 1.0, 2.0, 3.0] {
            let slow = tree.predict_leaf(&[v]).unwrap();
            let fast = tree.predict_leaf_fast(&[v]).unwrap();
            assert_eq!(slow, fast);
        }
    }

    #[test]
    fn constant_feature_yields_a_single_leaf() {
        let x: Tensor<f64> = Tensor::from_vec2d(&[vec![5.0], vec![5.0], vec![5.0], vec![5.0]]).unwrap();
        let y: Tensor<f64> = Tensor::from_vec2d(&[vec![0.0], vec![0.0], vec![1.0], vec![1.0]]).unwrap();
        let annot = Annotations::compact_classification(&y).unwrap();
        let provider = Provider::root(&x, annot, None).unwrap();

        let mut tree = Tree::new(two_class_config()).unwrap();
        let mut scratch = ThresholdScratch::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        tree.fit(&provider, &mut scratch, &mut rng).unwrap();

        assert_eq!(tree.n_nodes(), 1);
        match tree.leaf(0).unwrap() {
            LeafRecord::Classification(probs) => {
                assert!((probs[0] - 0.5).abs() < 1e-9);
                assert!((probs[1] - 0.5).abs() < 1e-9);
            }
            _ => panic!("expected classification leaf"),
        }
    }
}
