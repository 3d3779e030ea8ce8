//! # forest
//!
//! A decision-forest training and inference engine: random forests over
//! dense numeric feature matrices, for both classification and
//! regression.
//!
//! ## Modules
//!
//! - **core** — Numeric primitives: the `Float` trait, `Tensor`, `Shape`, errors
//! - **linalg** — Rank-revealing QR and least-squares solve for the linear-regression leaf
//! - **tree** — Impurity, split search, deciders, leaves, trees, the forest, the thread pool
//! - **io** — Model persistence: `.json` and `.fpf` forest files

/// Numeric primitives shared by every crate here.
pub use forest_core as core;

/// Linear algebra for the linear-regression leaf.
pub use forest_linalg as linalg;

/// Trees, forests, and the machinery that grows them.
pub use forest_tree as tree;

/// Model persistence.
pub use forest_io as io;

pub use forest_core::{Float, ForestError, Shape, Tensor};
pub use forest_tree::{ClassificationForest, LinearLeafFallback, RegressionForest};
