//! C7: forest — builds `n_trees` trees in parallel and combines their
//! predictions.
//!
//! Grounded on `original_source/include/forpy/forest.h` and
//! `src/forpy/forest.cpp` (the `forpy` C++ library's `Forest`,
//! `ClassificationForest`, `RegressionForest`): the constructor
//! parameter lists in spec §6 are exactly `ClassificationForest`'s and
//! `RegressionForest`'s, and `fit_dprov`'s bootstrap-then-dispatch
//! sequence is mirrored by `Pool::run_per_tree` (see `pool.rs`) standing
//! in for `forpy`'s `ThreadControl`.

use log::warn;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use forest_core::{Float, ForestError, Tensor};

use crate::decider::DeciderConfig;
use crate::impurity::{Impurity, EPS_GAIN};
use crate::leaf::LinearLeafFallback;
use crate::pool::Pool;
use crate::provider::{bootstrap_usage_map, identity_usage_map, AnnotView, Annotations, Provider};
use crate::threshold::ThresholdPolicy;
use crate::tree::{aggregate_leaves, LeafKind, LeafRecord, Tree, TreeConfig};

/// Shared forest-level construction parameters (spec §4.7, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ForestConfig {
    n_trees: usize,
    random_seed: u64,
}

impl ForestConfig {
    fn validate(&self) -> Result<(), ForestError> {
        if self.n_trees < 2 {
            return Err(ForestError::InvalidParam(
                "n_trees must be >= 2 to form a forest".into(),
            ));
        }
        Ok(())
    }
}

fn policy_from_n_thresholds(n_thresholds: usize) -> ThresholdPolicy {
    if n_thresholds == 0 {
        ThresholdPolicy::Exact
    } else {
        ThresholdPolicy::Random(n_thresholds)
    }
}

/// Builds the per-tree usage map (bootstrap weights/indices, spec §4.5)
/// and spawns one `Provider` per tree sharing the root's backing
/// storage. The forest-level RNG used here runs only on the single
/// driver thread before dispatch (spec §5).
fn spawn_tree_providers<T: Float>(
    root: &Provider<T>,
    n_trees: usize,
    bootstrap: bool,
    weights: Option<&[f32]>,
    forest_rng: &mut ChaCha8Rng,
) -> Result<Vec<Provider<T>>, ForestError> {
    let n = root.n_samples();
    let usage_map = if bootstrap {
        bootstrap_usage_map(n, n_trees, forest_rng)?
    } else {
        identity_usage_map(n, weights, n_trees)
    };
    Ok(root.spawn_tree_providers(&usage_map))
}

/// Resolve the "did the caller pass X with samples as columns instead
/// of rows" mixup (spec §4.7 step 1). `forpy`'s own check
/// (`data.rows() == annotations.rows() && data.cols() != annotations.rows()`,
/// see `forest.cpp`) is written against its col-major "features as rows,
/// samples as columns" convention; translated to this crate's row-major
/// `(n_samples, n_features)` convention the equivalent mixup is "`X`'s
/// row count doesn't match `Y`'s row count, but `X`'s column count
/// does" — so that's the condition implemented here.
fn maybe_transpose<T: Float>(x: &Tensor<T>, y_rows: usize) -> Result<Tensor<T>, ForestError> {
    let x_rows = x.shape().dim(0)?;
    let x_cols = x.shape().dim(1)?;
    if x_rows != y_rows && x_cols == y_rows {
        warn!(
            "X has {x_rows} rows and {x_cols} columns but Y has {y_rows} rows; \
             X looks transposed (samples as columns). Copying a transposed X."
        );
        let mut data = vec![T::ZERO; x_rows * x_cols];
        for i in 0..x_rows {
            for j in 0..x_cols {
                data[j * x_rows + i] = x.get(&[i, j])?;
            }
        }
        // `data` is now column-major (x_cols, x_rows) in row-major storage.
        Tensor::new(data, vec![x_cols, x_rows])
    } else {
        Ok(x.clone())
    }
}

/// Drive one tree's growth to completion from its provider, returning
/// the finished tree (spec §4.7 step 5: "push its root work item onto
/// the thread pool").
fn fit_one_tree<T: Float, R: Rng>(
    tree_cfg: &TreeConfig,
    provider: &Provider<T>,
    rng: &mut R,
    scratch: &mut crate::threshold::ThresholdScratch<T>,
) -> Result<Tree<T>, ForestError> {
    let mut tree = Tree::new(tree_cfg.clone())?;
    tree.fit(provider, scratch, rng)?;
    Ok(tree)
}

/// A forest over classification targets: `n_trees` trees, each voting a
/// class-probability distribution combined by the leaf aggregator
/// (spec §4.4, §4.7).
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound = "T: Float")]
pub struct ClassificationForest<T: Float> {
    forest: ForestConfig,
    tree_cfg: TreeConfig,
    trees: Vec<Tree<T>>,
    classes: Vec<T>,
    n_classes: usize,
    feat_dim: usize,
    fitted: bool,
}

impl<T: Float> ClassificationForest<T> {
    /// Mirrors `forpy::ClassificationForest`'s constructor (spec §6).
    /// `n_valid_features_to_use == 0` means "use all features";
    /// `autoscale_valid_features` resolves it to `sqrt(d)` instead, and
    /// is rejected (`InvalidParam`) together with a nonzero explicit
    /// count (spec §7 table, §9).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        n_trees: usize,
        max_depth: usize,
        min_samples_at_leaf: usize,
        min_samples_at_node: usize,
        n_valid_features_to_use: usize,
        autoscale_valid_features: bool,
        random_seed: u64,
        n_thresholds: usize,
        gain_threshold: f64,
    ) -> Result<Self, ForestError> {
        let forest = ForestConfig { n_trees, random_seed };
        forest.validate()?;
        let decider = DeciderConfig {
            f_try: n_valid_features_to_use,
            autoscale: autoscale_valid_features,
            gain_threshold,
            msal: min_samples_at_leaf,
            policy: policy_from_n_thresholds(n_thresholds),
            impurity: Impurity::Induced(2.0),
        };
        let tree_cfg = TreeConfig {
            max_depth,
            msal: min_samples_at_leaf,
            msan: min_samples_at_node,
            decider,
            // `n_classes` is a placeholder until `fit` compacts labels;
            // `fit` rebuilds `tree_cfg` with the true count before
            // growing any tree.
            leaf_kind: LeafKind::Classification { n_classes: 0 },
        };
        tree_cfg.validate()?;
        Ok(ClassificationForest {
            forest,
            tree_cfg,
            trees: Vec::new(),
            classes: Vec::new(),
            n_classes: 0,
            feat_dim: 0,
            fitted: false,
        })
    }

    pub fn n_trees(&self) -> usize {
        self.forest.n_trees
    }

    pub fn trees(&self) -> &[Tree<T>] {
        &self.trees
    }

    /// Fit the forest (spec §4.7 `fit`).
    pub fn fit(
        &mut self,
        x: &Tensor<T>,
        y: &Tensor<T>,
        n_threads: usize,
        bootstrap: bool,
        weights: Option<&[f32]>,
    ) -> Result<(), ForestError> {
        let y_rows = y.shape().dim(0)?;
        let x_fixed = maybe_transpose(x, y_rows)?;

        let annotations = Annotations::compact_classification(y)?;
        let n_classes = annotations.n_classes().expect("classification annotations");
        let classes: Vec<T> = (0..n_classes as u32)
            .map(|c| annotations.original_class_label(c).expect("known class code"))
            .collect();

        let root = Provider::root(&x_fixed, annotations, weights)?;
        self.tree_cfg.leaf_kind = LeafKind::Classification { n_classes };
        self.tree_cfg.validate()?;

        let mut forest_rng = ChaCha8Rng::seed_from_u64(self.forest.random_seed);
        let providers =
            spawn_tree_providers(&root, self.forest.n_trees, bootstrap, weights, &mut forest_rng)?;

        let pool = Pool::new(n_threads)?;
        let tree_cfg = self.tree_cfg.clone();
        let trees = pool.run_per_tree::<T, _, Tree<T>>(
            self.forest.n_trees,
            self.forest.random_seed,
            move |tree_index, desk| {
                fit_one_tree(&tree_cfg, &providers[tree_index], &mut desk.rng, &mut desk.scratch)
            },
        )?;

        self.trees = trees;
        self.classes = classes;
        self.n_classes = n_classes;
        self.feat_dim = root.feat_dim();
        self.fitted = true;
        Ok(())
    }

    pub fn enable_fast_prediction(&mut self) {
        for tree in self.trees.iter_mut() {
            tree.enable_fast_prediction();
        }
    }

    /// Predict over `x` (spec §4.7 `predict`). When `predict_proba` is
    /// false, returns a single column of predicted original class
    /// labels; when true, returns the class-probability distribution
    /// expanded into the original label space — a dense row of width
    /// `max(original label) + 1`, zero outside the observed labels
    /// (spec §4.4 `get_result`, grounded on `classificationleaf.cpp`'s
    /// `class_transl_ptr`-indexed expansion).
    pub fn predict(
        &self,
        x: &Tensor<T>,
        use_fast_prediction: bool,
        predict_proba: bool,
    ) -> Result<Tensor<T>, ForestError> {
        if !self.fitted {
            return Err(ForestError::NotInitialized("forest has not been fit yet".into()));
        }
        let n = x.shape().dim(0)?;
        let d = x.shape().dim(1)?;
        if d != self.feat_dim {
            return Err(ForestError::Shape(format!(
                "X has {d} features, forest was trained on {}", self.feat_dim
            )));
        }

        let max_label = self
            .classes
            .iter()
            .map(|c| c.to_f64().round() as usize)
            .max()
            .unwrap_or(0);
        let out_dim = if predict_proba { max_label + 1 } else { 1 };
        let mut out = vec![T::ZERO; n * out_dim];

        for i in 0..n {
            let row: Vec<T> = (0..d).map(|j| x.get(&[i, j]).unwrap()).collect();
            let mut per_tree: Vec<(&LeafRecord<T>, f64)> = Vec::with_capacity(self.trees.len());
            for tree in &self.trees {
                let leaf_id = if use_fast_prediction {
                    tree.predict_leaf_fast(&row)?
                } else {
                    tree.predict_leaf(&row)?
                };
                let record = tree.leaf(leaf_id).ok_or_else(|| {
                    ForestError::Internal(format!("no leaf record stored for node {leaf_id}"))
                })?;
                per_tree.push((record, tree.weight));
            }
            let combined = aggregate_leaves(&per_tree, Some(self.n_classes), None)?;
            match combined {
                LeafRecord::Classification(probs) => {
                    if predict_proba {
                        for (code, &p) in probs.iter().enumerate() {
                            let label = self.classes[code].to_f64().round() as usize;
                            out[i * out_dim + label] = T::from_f64(p);
                        }
                    } else {
                        let argmax = probs
                            .iter()
                            .enumerate()
                            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                            .map(|(idx, _)| idx)
                            .unwrap_or(0);
                        out[i * out_dim] = self.classes[argmax];
                    }
                }
                _ => unreachable!("classification forest always aggregates to Classification"),
            }
        }

        Tensor::new(out, vec![n, out_dim])
    }
}

/// A forest over regression targets: `n_trees` trees, each predicting a
/// per-output mean (optionally with variance or a linear fit), combined
/// by the leaf aggregator (spec §4.4, §4.7).
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound = "T: Float")]
pub struct RegressionForest<T: Float> {
    forest: ForestConfig,
    tree_cfg: TreeConfig,
    trees: Vec<Tree<T>>,
    k: usize,
    feat_dim: usize,
    /// Whether leaves store a variance alongside the mean (spec §6
    /// `RegressionForest::new(..., store_variance, summarize)`).
    store_variance: bool,
    /// Whether `predict(..., predict_proba=true)` is allowed to return
    /// the combined mean+variance summary rather than mean only
    /// (grounded on `regressionleaf.cpp`'s `predict_proba && summarize`
    /// gate).
    summarize: bool,
    fitted: bool,
}

impl<T: Float> RegressionForest<T> {
    /// Mirrors `forpy::RegressionForest`'s constructor (spec §6).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        n_trees: usize,
        max_depth: usize,
        min_samples_at_leaf: usize,
        min_samples_at_node: usize,
        n_valid_features_to_use: usize,
        autoscale_valid_features: bool,
        random_seed: u64,
        n_thresholds: usize,
        gain_threshold: f64,
        store_variance: bool,
        summarize: bool,
    ) -> Result<Self, ForestError> {
        let forest = ForestConfig { n_trees, random_seed };
        forest.validate()?;
        let decider = DeciderConfig {
            f_try: n_valid_features_to_use,
            autoscale: autoscale_valid_features,
            gain_threshold,
            msal: min_samples_at_leaf,
            policy: policy_from_n_thresholds(n_thresholds),
            impurity: Impurity::Induced(2.0), // unused by the regression variance-proxy path
        };
        let tree_cfg = TreeConfig {
            max_depth,
            msal: min_samples_at_leaf,
            msan: min_samples_at_node,
            decider,
            leaf_kind: LeafKind::Regression { k: 0, store_variance },
        };
        tree_cfg.validate()?;
        Ok(RegressionForest {
            forest,
            tree_cfg,
            trees: Vec::new(),
            k: 0,
            feat_dim: 0,
            store_variance,
            summarize,
            fitted: false,
        })
    }

    /// Switch this forest to fit linear-regression leaves instead of
    /// constant-mean leaves (spec §4.4 "Linear regression leaf").
    pub fn with_linear_leaves(mut self, fallback: LinearLeafFallback, tol: f64) -> Self {
        self.tree_cfg.leaf_kind = LeafKind::LinearRegression { k: 0, fallback, tol };
        self
    }

    pub fn n_trees(&self) -> usize {
        self.forest.n_trees
    }

    pub fn trees(&self) -> &[Tree<T>] {
        &self.trees
    }

    pub fn fit(
        &mut self,
        x: &Tensor<T>,
        y: &Tensor<T>,
        n_threads: usize,
        bootstrap: bool,
        weights: Option<&[f32]>,
    ) -> Result<(), ForestError> {
        let y_rows = y.shape().dim(0)?;
        let x_fixed = maybe_transpose(x, y_rows)?;

        let annotations = Annotations::from_regression(y)?;
        let k = match annotations.view() {
            AnnotView::Regression { k, .. } => k,
            AnnotView::Classification { .. } => unreachable!(),
        };

        let root = Provider::root(&x_fixed, annotations, weights)?;
        self.tree_cfg.leaf_kind = match &self.tree_cfg.leaf_kind {
            LeafKind::LinearRegression { fallback, tol, .. } => {
                LeafKind::LinearRegression { k, fallback: *fallback, tol: *tol }
            }
            _ => LeafKind::Regression { k, store_variance: self.store_variance },
        };
        self.tree_cfg.validate()?;

        let mut forest_rng = ChaCha8Rng::seed_from_u64(self.forest.random_seed);
        let providers =
            spawn_tree_providers(&root, self.forest.n_trees, bootstrap, weights, &mut forest_rng)?;

        let pool = Pool::new(n_threads)?;
        let tree_cfg = self.tree_cfg.clone();
        let trees = pool.run_per_tree::<T, _, Tree<T>>(
            self.forest.n_trees,
            self.forest.random_seed,
            move |tree_index, desk| {
                fit_one_tree(&tree_cfg, &providers[tree_index], &mut desk.rng, &mut desk.scratch)
            },
        )?;

        self.trees = trees;
        self.k = k;
        self.feat_dim = root.feat_dim();
        self.fitted = true;
        Ok(())
    }

    pub fn enable_fast_prediction(&mut self) {
        for tree in self.trees.iter_mut() {
            tree.enable_fast_prediction();
        }
    }

    /// Predict over `x` (spec §4.7 `predict`). `predict_proba` is only
    /// meaningful when this forest was built with `summarize = true`;
    /// in that case the output interleaves mean and variance per output
    /// dimension (`[mean_0, var_0, mean_1, var_1, ...]`), matching
    /// `regressionleaf.cpp`'s summarized layout. Otherwise (or when
    /// `summarize` is false) only the `k` means are returned.
    pub fn predict(
        &self,
        x: &Tensor<T>,
        use_fast_prediction: bool,
        predict_proba: bool,
    ) -> Result<Tensor<T>, ForestError> {
        if !self.fitted {
            return Err(ForestError::NotInitialized("forest has not been fit yet".into()));
        }
        let n = x.shape().dim(0)?;
        let d = x.shape().dim(1)?;
        if d != self.feat_dim {
            return Err(ForestError::Shape(format!(
                "X has {d} features, forest was trained on {}", self.feat_dim
            )));
        }

        let summarized = predict_proba && self.summarize;
        let out_dim = if summarized { 2 * self.k } else { self.k };
        let mut out = vec![T::ZERO; n * out_dim];

        for i in 0..n {
            let row: Vec<T> = (0..d).map(|j| x.get(&[i, j]).unwrap()).collect();
            let mut resolved: Vec<LeafRecord<T>> = Vec::with_capacity(self.trees.len());
            for tree in &self.trees {
                let leaf_id = if use_fast_prediction {
                    tree.predict_leaf_fast(&row)?
                } else {
                    tree.predict_leaf(&row)?
                };
                let record = tree.leaf(leaf_id).ok_or_else(|| {
                    ForestError::Internal(format!("no leaf record stored for node {leaf_id}"))
                })?;
                resolved.push(resolve_for_point(record, &row));
            }
            let per_tree: Vec<(&LeafRecord<T>, f64)> = self
                .trees
                .iter()
                .zip(resolved.iter())
                .map(|(tree, record)| (record, tree.weight))
                .collect();
            let combined = aggregate_leaves(&per_tree, None, Some(self.k))?;
            match combined {
                LeafRecord::Regression { mean, variance } => {
                    for j in 0..self.k {
                        if summarized {
                            out[i * out_dim + 2 * j] = mean[j];
                            out[i * out_dim + 2 * j + 1] =
                                variance.as_ref().map(|v| v[j]).unwrap_or(T::ZERO);
                        } else {
                            out[i * out_dim + j] = mean[j];
                        }
                    }
                }
                _ => unreachable!("regression forest always aggregates to Regression"),
            }
        }

        Tensor::new(out, vec![n, out_dim])
    }
}

/// A linear-regression leaf's point prediction needs `x` itself, so it
/// can't be combined by `aggregate_leaves` directly; resolve it to a
/// plain `Regression` record first (spec §4.4 note on linear leaves).
fn resolve_for_point<T: Float>(record: &LeafRecord<T>, x: &[T]) -> LeafRecord<T> {
    match record {
        LeafRecord::Linear(leaf) => {
            let mean = leaf.predict(x);
            let variance = Some(leaf.residual_variance.clone());
            LeafRecord::Regression { mean, variance }
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xy_two_class() -> (Tensor<f64>, Tensor<f64>) {
        let x =
            Tensor::from_vec2d(&[vec![0.0], vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let y =
            Tensor::from_vec2d(&[vec![0.0], vec![0.0], vec![1.0], vec![1.0]]).unwrap();
        (x, y)
    }

    #[test]
    fn classification_forest_separates_two_classes() {
        let (x, y) = xy_two_class();
        let mut forest =
            ClassificationForest::<f64>::new(2, 2, 1, 2, 0, false, 1, 0, EPS_GAIN).unwrap();
        forest.fit(&x, &y, 1, false, None).unwrap();
        let preds = forest.predict(&x, false, false).unwrap();
        assert_eq!(preds.data(), &[0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn classification_forest_proba_is_confident_on_separable_data() {
        let (x, y) = xy_two_class();
        let mut forest =
            ClassificationForest::<f64>::new(2, 2, 1, 2, 0, false, 1, 0, EPS_GAIN).unwrap();
        forest.fit(&x, &y, 1, false, None).unwrap();
        let probs = forest.predict(&x, false, true).unwrap();
        assert_eq!(probs.shape_vec(), vec![4, 2]);
        assert!((probs.get(&[0, 0]).unwrap() - 1.0).abs() < 1e-9);
        assert!((probs.get(&[3, 1]).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn regression_forest_predicts_piecewise_mean() {
        let x = Tensor::from_vec2d(&[vec![0.0], vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let y =
            Tensor::from_vec2d(&[vec![10.0], vec![10.0], vec![20.0], vec![20.0]]).unwrap();
        let mut forest =
            RegressionForest::<f64>::new(2, 2, 1, 2, 0, false, 1, 0, EPS_GAIN, true, true).unwrap();
        forest.fit(&x, &y, 1, false, None).unwrap();
        let preds = forest.predict(&x, false, false).unwrap();
        assert_eq!(preds.data(), &[10.0, 10.0, 20.0, 20.0]);
    }

    #[test]
    fn n_trees_below_two_is_rejected() {
        let err = ClassificationForest::<f64>::new(1, 2, 1, 2, 0, false, 1, 0, EPS_GAIN);
        assert!(err.is_err());
    }

    #[test]
    fn two_identical_trees_match_one_tree() {
        let (x, y) = xy_two_class();
        let mut forest_two =
            ClassificationForest::<f64>::new(2, 2, 1, 2, 0, false, 1, 0, EPS_GAIN).unwrap();
        forest_two.fit(&x, &y, 1, false, None).unwrap();

        let mut tree = Tree::new(forest_two.tree_cfg.clone()).unwrap();
        let provider = Provider::root(
            &x,
            Annotations::compact_classification(&y).unwrap(),
            None,
        )
        .unwrap();
        let mut scratch = crate::threshold::ThresholdScratch::new();
        let mut rng = ChaCha8Rng::seed_from_u64(forest_two.forest.random_seed + 0 + 1);
        tree.fit(&provider, &mut scratch, &mut rng).unwrap();

        for &v in &[0.0, 1.0, 2.0, 3.0] {
            let single_leaf = tree.predict_leaf(&[v]).unwrap();
            let forest_pred = forest_two.predict(&Tensor::from_vec2d(&[vec![v]]).unwrap(), false, false).unwrap();
            let single_pred = match tree.leaf(single_leaf).unwrap() {
                LeafRecord::Classification(probs) => {
                    probs.iter().enumerate().max_by(|a, b| a.1.partial_cmp(b.1).unwrap()).unwrap().0
                }
                _ => panic!("expected classification leaf"),
            };
            assert_eq!(forest_pred.data()[0] as usize, single_pred);
        }
    }
}
