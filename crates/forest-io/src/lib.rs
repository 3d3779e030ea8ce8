//! Model persistence for the decision-forest crates.
//!
//! - `save_classification_forest` / `load_classification_forest`
//! - `save_regression_forest` / `load_regression_forest`
//!
//! Both accept a path ending in `.json` (human-readable) or `.fpf`
//! (compact binary); `load_*` infers the format from either extension,
//! `save_*` rejects anything else.

pub mod format;

pub use format::*;
