//! C5: data provider.
//!
//! Owns the column-major, feature-contiguous sample matrix and the
//! annotation matrix, and hands out lightweight per-tree views sharing
//! the same backing storage. Grounded on
//! `original_source/include/forpy/data_providers/` (the `forpy` C++
//! library's `PlainDataProvider`) for the contract shape, and on
//! `oxidize-ml-core::Tensor` (row-major, the public boundary type) for
//! what gets repacked on the way in.

use std::sync::Arc;

use forest_core::{Float, ForestError, Tensor};
use rand::Rng;
use rand_distr::{Binomial, Distribution};

/// Column-major, feature-contiguous backing storage for `X`. Column `j`
/// occupies `data[j * n .. (j + 1) * n]`, so `feature_column` is a
/// plain contiguous slice — the access pattern the threshold optimizer
/// needs on every node (spec §3: "Memory layout is column-major
/// (feature-contiguous)").
#[derive(Debug)]
pub struct Columns<T: Float> {
    data: Vec<T>,
    n_samples: usize,
    feat_dim: usize,
}

impl<T: Float> Columns<T> {
    /// Repack a row-major `Tensor` (the public boundary layout) into
    /// column-major storage.
    pub fn from_row_major(x: &Tensor<T>) -> Result<Self, ForestError> {
        if x.ndim() != 2 {
            return Err(ForestError::Shape("X must be a 2D tensor".into()));
        }
        let n_samples = x.shape().dim(0)?;
        let feat_dim = x.shape().dim(1)?;
        let mut data = vec![T::ZERO; n_samples * feat_dim];
        for i in 0..n_samples {
            for j in 0..feat_dim {
                data[j * n_samples + i] = x.get(&[i, j])?;
            }
        }
        Ok(Columns { data, n_samples, feat_dim })
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn feat_dim(&self) -> usize {
        self.feat_dim
    }

    pub fn feature_column(&self, j: usize) -> &[T] {
        &self.data[j * self.n_samples..(j + 1) * self.n_samples]
    }
}

/// Integer codes for classification, or real-valued rows for
/// regression, both indexed by sample id. Classification also keeps
/// the original label values for inverse mapping at prediction time
/// (spec §3: "Class compaction").
#[derive(Debug)]
pub enum Annotations<T: Float> {
    Classification { codes: Vec<u32>, n_classes: usize, classes: Vec<T> },
    /// Row-major `n * k`: row `i` at `data[i*k..(i+1)*k]`.
    Regression { data: Vec<T>, k: usize },
}

/// Borrowed view of one tree's annotations, handed to the threshold
/// optimizer and leaf builder.
pub enum AnnotView<'a, T: Float> {
    Classification { codes: &'a [u32], n_classes: usize },
    Regression { data: &'a [T], k: usize },
}

impl<T: Float> Annotations<T> {
    /// Scan a column of non-negative integral values, assigning dense
    /// codes `0..C-1` to distinct values in order of first appearance.
    pub fn compact_classification(y: &Tensor<T>) -> Result<Self, ForestError> {
        if y.ndim() != 2 || y.shape().dim(1)? != 1 {
            return Err(ForestError::Shape("classification Y must have shape (n, 1)".into()));
        }
        let n = y.shape().dim(0)?;
        let mut classes: Vec<T> = Vec::new();
        let mut codes = Vec::with_capacity(n);
        for i in 0..n {
            let v = y.get(&[i, 0])?;
            if v.to_f64().fract() != 0.0 || v.to_f64() < 0.0 {
                return Err(ForestError::InvalidParam(format!(
                    "classification label at row {i} is not a non-negative integer: {v}"
                )));
            }
            let code = match classes.iter().position(|&c| c.to_f64() == v.to_f64()) {
                Some(idx) => idx,
                None => {
                    classes.push(v);
                    classes.len() - 1
                }
            };
            codes.push(code as u32);
        }
        let n_classes = classes.len();
        Ok(Annotations::Classification { codes, n_classes, classes })
    }

    pub fn from_regression(y: &Tensor<T>) -> Result<Self, ForestError> {
        if y.ndim() != 2 {
            return Err(ForestError::Shape("regression Y must be 2D".into()));
        }
        let k = y.shape().dim(1)?;
        Ok(Annotations::Regression { data: y.data().to_vec(), k })
    }

    pub fn view(&self) -> AnnotView<'_, T> {
        match self {
            Annotations::Classification { codes, n_classes, .. } => {
                AnnotView::Classification { codes, n_classes: *n_classes }
            }
            Annotations::Regression { data, k } => AnnotView::Regression { data, k: *k },
        }
    }

    pub fn n_classes(&self) -> Option<usize> {
        match self {
            Annotations::Classification { n_classes, .. } => Some(*n_classes),
            Annotations::Regression { .. } => None,
        }
    }

    pub fn original_class_label(&self, code: u32) -> Option<T> {
        match self {
            Annotations::Classification { classes, .. } => classes.get(code as usize).copied(),
            Annotations::Regression { .. } => None,
        }
    }
}

/// One tree's (or the root's) view over the shared sample/annotation
/// storage: its own mutable sample-id permutation and effective
/// per-sample weights, everything else shared read-only.
pub struct Provider<T: Float> {
    columns: Arc<Columns<T>>,
    annotations: Arc<Annotations<T>>,
    /// Effective weight for every global sample id (dense, length
    /// `n_samples`); zero for samples this tree never sees.
    weights: Arc<Vec<f32>>,
    /// This tree's initial mutable sample-id permutation: every id with
    /// nonzero weight, in construction order.
    sample_ids: Vec<u32>,
}

impl<T: Float> Provider<T> {
    /// Build the root provider: every sample present once, weighted by
    /// the caller-supplied weights (or all-ones if absent).
    pub fn root(
        x: &Tensor<T>,
        annotations: Annotations<T>,
        weights: Option<&[f32]>,
    ) -> Result<Self, ForestError> {
        let columns = Columns::from_row_major(x)?;
        let n = columns.n_samples();
        let w = match weights {
            Some(w) => {
                if w.len() != n {
                    return Err(ForestError::Shape(format!(
                        "weights has {} elements, expected {n}", w.len()
                    )));
                }
                if w.iter().any(|&v| v < 0.0) {
                    return Err(ForestError::InvalidParam("weights must be non-negative".into()));
                }
                w.to_vec()
            }
            None => vec![1.0f32; n],
        };
        let sample_ids = (0..n as u32).collect();
        Ok(Provider {
            columns: Arc::new(columns),
            annotations: Arc::new(annotations),
            weights: Arc::new(w),
            sample_ids,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.columns.n_samples()
    }

    pub fn feat_dim(&self) -> usize {
        self.columns.feat_dim()
    }

    pub fn annot_dim(&self) -> usize {
        match self.annotations.view() {
            AnnotView::Classification { .. } => 1,
            AnnotView::Regression { k, .. } => k,
        }
    }

    pub fn feature_column(&self, j: usize) -> &[T] {
        self.columns.feature_column(j)
    }

    pub fn annotations(&self) -> AnnotView<'_, T> {
        self.annotations.view()
    }

    pub fn annotations_owner(&self) -> &Annotations<T> {
        &self.annotations
    }

    pub fn weights(&self) -> Option<&[f32]> {
        Some(&self.weights)
    }

    pub fn initial_sample_list(&self) -> &[u32] {
        &self.sample_ids
    }

    /// Given a per-tree usage map (dense sample ids with nonzero weight,
    /// and their weights), produce lightweight sub-providers sharing
    /// this provider's `X`/`Y` storage read-only (spec §4.5).
    pub fn spawn_tree_providers(&self, usage_map: &[(Vec<u32>, Vec<f32>)]) -> Vec<Provider<T>> {
        let n = self.n_samples();
        usage_map
            .iter()
            .map(|(ids, per_id_weight)| {
                let mut dense_weights = vec![0.0f32; n];
                for (&id, &w) in ids.iter().zip(per_id_weight.iter()) {
                    dense_weights[id as usize] = w;
                }
                Provider {
                    columns: Arc::clone(&self.columns),
                    annotations: Arc::clone(&self.annotations),
                    weights: Arc::new(dense_weights),
                    sample_ids: ids.clone(),
                }
            })
            .collect()
    }
}

/// Draw a per-tree usage map via bootstrap resampling: for each sample,
/// a count from `Binomial(n, 1/n)`; zero-count samples are excluded and
/// nonzero counts become that sample's weight in the tree (spec §4.5,
/// §3 "Bootstrap"; grounded on
/// `original_source/include/forpy/util/sampling.h`'s
/// `std::binomial_distribution<>(n, 1/n)` draw).
pub fn bootstrap_usage_map<R: Rng>(
    n: usize,
    n_trees: usize,
    rng: &mut R,
) -> Result<Vec<(Vec<u32>, Vec<f32>)>, ForestError> {
    if n == 0 {
        return Err(ForestError::Empty);
    }
    let dist = Binomial::new(n as u64, 1.0 / n as f64)
        .map_err(|e| ForestError::Internal(format!("invalid binomial bootstrap parameters: {e}")))?;
    let mut maps = Vec::with_capacity(n_trees);
    for _ in 0..n_trees {
        let mut ids = Vec::with_capacity(n);
        let mut weights = Vec::with_capacity(n);
        for i in 0..n {
            let count = dist.sample(rng);
            if count > 0 {
                ids.push(i as u32);
                weights.push(count as f32);
            }
        }
        maps.push((ids, weights));
    }
    Ok(maps)
}

/// Non-bootstrap usage map: every tree sees every sample at its
/// original weight (or 1.0 if none given).
pub fn identity_usage_map(n: usize, weights: Option<&[f32]>, n_trees: usize) -> Vec<(Vec<u32>, Vec<f32>)> {
    let ids: Vec<u32> = (0..n as u32).collect();
    let w: Vec<f32> = weights.map(|w| w.to_vec()).unwrap_or_else(|| vec![1.0; n]);
    (0..n_trees).map(|_| (ids.clone(), w.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn repacks_row_major_into_feature_contiguous_columns() {
        let x: Tensor<f64> = Tensor::from_vec2d(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap();
        let cols = Columns::from_row_major(&x).unwrap();
        assert_eq!(cols.feature_column(0), &[1.0, 3.0, 5.0]);
        assert_eq!(cols.feature_column(1), &[2.0, 4.0, 6.0]);
    }

    #[test]
    fn classification_compaction_assigns_dense_codes() {
        let y: Tensor<f64> = Tensor::from_vec2d(&[vec![5.0], vec![5.0], vec![2.0], vec![2.0]]).unwrap();
        let annot = Annotations::compact_classification(&y).unwrap();
        match annot {
            Annotations::Classification { codes, n_classes, classes } => {
                assert_eq!(n_classes, 2);
                assert_eq!(codes, vec![0, 0, 1, 1]);
                assert_eq!(classes, vec![5.0, 2.0]);
            }
            _ => panic!("expected classification annotations"),
        }
    }

    #[test]
    fn bootstrap_usage_map_mean_count_is_one_per_sample() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let n = 50;
        let n_trees = 200;
        let maps = bootstrap_usage_map(n, n_trees, &mut rng).unwrap();
        let mut totals = vec![0.0f64; n];
        for (ids, weights) in &maps {
            for (&id, &w) in ids.iter().zip(weights.iter()) {
                totals[id as usize] += w as f64;
            }
        }
        let mean: f64 = totals.iter().sum::<f64>() / n as f64;
        assert!((mean - n_trees as f64).abs() < 0.1 * n_trees as f64);
    }

    #[test]
    fn spawn_tree_providers_share_columns() {
        let x: Tensor<f64> = Tensor::from_vec2d(&[vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let y: Tensor<f64> = Tensor::from_vec2d(&[vec![0.0], vec![0.0], vec![1.0]]).unwrap();
        let annot = Annotations::compact_classification(&y).unwrap();
        let root = Provider::root(&x, annot, None).unwrap();
        let usage = identity_usage_map(3, None, 2);
        let trees = root.spawn_tree_providers(&usage);
        assert_eq!(trees.len(), 2);
        assert_eq!(trees[0].feature_column(0), root.feature_column(0));
    }
}
