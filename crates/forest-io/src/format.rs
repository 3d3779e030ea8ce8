//! Save/load a forest to disk, as either a human-readable `.json` file
//! or a compact `.fpf` binary file.
//!
//! Grounded on `oxidize-ml-io::model_io` (the teacher's `save_model` /
//! `load_model`, which round-trip a model through
//! `serde_json::to_string_pretty` / `fs::write`): extended here with a
//! second on-disk format (`bincode`, already a workspace dependency) and
//! extension-based dispatch, since persisted forests are large enough
//! that a binary format earns its place alongside the readable one.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use forest_core::{Float, ForestError};
use forest_tree::{ClassificationForest, LeafRecord, RegressionForest, Tree};

/// A linear-regression leaf must release its retained design matrix and
/// targets before it can be written to disk (spec §6 freeze rule).
/// Every leaf produced by `Tree::fit` is already frozen; this only
/// guards against a hand-assembled tree being saved unfrozen.
fn check_frozen<T: Float>(trees: &[Tree<T>]) -> Result<(), ForestError> {
    for tree in trees {
        for leaf in tree.leaves() {
            if let LeafRecord::Linear(linear) = leaf {
                if !linear.is_frozen() {
                    return Err(ForestError::NotFrozen(
                        "a linear-regression leaf retains its training support; call freeze() \
                         (or refit through Tree::fit, which always freezes) before saving"
                            .into(),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn write_by_extension<T: Serialize>(value: &T, path: &Path) -> Result<(), ForestError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            let json = serde_json::to_string_pretty(value)
                .map_err(|e| ForestError::Internal(format!("failed to encode model as JSON: {e}")))?;
            fs::write(path, json)
                .map_err(|e| ForestError::Internal(format!("failed to write {}: {e}", path.display())))
        }
        Some("fpf") => {
            let bytes = bincode::serialize(value)
                .map_err(|e| ForestError::Internal(format!("failed to encode model as bincode: {e}")))?;
            fs::write(path, bytes)
                .map_err(|e| ForestError::Internal(format!("failed to write {}: {e}", path.display())))
        }
        other => Err(ForestError::Unsupported(format!(
            "cannot save to {}: unknown extension {other:?}, expected .json or .fpf",
            path.display()
        ))),
    }
}

fn read_by_extension<T: DeserializeOwned>(path: &Path) -> Result<T, ForestError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            let text = fs::read_to_string(path)
                .map_err(|e| ForestError::Corruption(format!("failed to read {}: {e}", path.display())))?;
            serde_json::from_str(&text)
                .map_err(|e| ForestError::Corruption(format!("malformed JSON model file: {e}")))
        }
        Some("fpf") => {
            let bytes = fs::read(path)
                .map_err(|e| ForestError::Corruption(format!("failed to read {}: {e}", path.display())))?;
            bincode::deserialize(&bytes)
                .map_err(|e| ForestError::Corruption(format!("malformed bincode model file: {e}")))
        }
        other => Err(ForestError::Unsupported(format!(
            "cannot load {}: unknown extension {other:?}, expected .json or .fpf",
            path.display()
        ))),
    }
}

/// Save a classification forest (spec §6 `save`). Rejects any extension
/// other than `.json`/`.fpf`, and any forest carrying an unfrozen
/// linear-regression leaf.
pub fn save_classification_forest<T>(
    forest: &ClassificationForest<T>,
    path: impl AsRef<Path>,
) -> Result<(), ForestError>
where
    T: Float + Serialize,
{
    check_frozen(forest.trees())?;
    write_by_extension(forest, path.as_ref())
}

/// Load a classification forest from either a `.json` or `.fpf` file.
pub fn load_classification_forest<T>(path: impl AsRef<Path>) -> Result<ClassificationForest<T>, ForestError>
where
    T: Float + DeserializeOwned,
{
    read_by_extension(path.as_ref())
}

/// Save a regression forest (spec §6 `save`). Same extension and
/// freeze-rule rules as `save_classification_forest`.
pub fn save_regression_forest<T>(
    forest: &RegressionForest<T>,
    path: impl AsRef<Path>,
) -> Result<(), ForestError>
where
    T: Float + Serialize,
{
    check_frozen(forest.trees())?;
    write_by_extension(forest, path.as_ref())
}

/// Load a regression forest from either a `.json` or `.fpf` file.
pub fn load_regression_forest<T>(path: impl AsRef<Path>) -> Result<RegressionForest<T>, ForestError>
where
    T: Float + DeserializeOwned,
{
    read_by_extension(path.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use forest_core::Tensor;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("forest-io-test-{name}-{}", std::process::id()))
    }

    #[test]
    fn json_round_trip_preserves_predictions() {
        let x: Tensor<f64> =
            Tensor::from_vec2d(&[vec![0.0], vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let y: Tensor<f64> =
            Tensor::from_vec2d(&[vec![0.0], vec![0.0], vec![1.0], vec![1.0]]).unwrap();
        let mut forest =
            ClassificationForest::<f64>::new(2, 2, 1, 2, 0, false, 1, 0, 1e-7).unwrap();
        forest.fit(&x, &y, 1, false, None).unwrap();

        let path = tmp_path("classification.json");
        save_classification_forest(&forest, &path).unwrap();
        let loaded: ClassificationForest<f64> = load_classification_forest(&path).unwrap();
        let _ = fs::remove_file(&path);

        let before = forest.predict(&x, false, false).unwrap();
        let after = loaded.predict(&x, false, false).unwrap();
        assert_eq!(before.data(), after.data());
    }

    #[test]
    fn fpf_round_trip_preserves_predictions() {
        let x: Tensor<f64> =
            Tensor::from_vec2d(&[vec![0.0], vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let y: Tensor<f64> = Tensor::from_vec2d(&[vec![10.0], vec![10.0], vec![20.0], vec![20.0]]).unwrap();
        let mut forest =
            RegressionForest::<f64>::new(2, 2, 1, 2, 0, false, 1, 0, 1e-7, true, true).unwrap();
        forest.fit(&x, &y, 1, false, None).unwrap();

        let path = tmp_path("regression.fpf");
        save_regression_forest(&forest, &path).unwrap();
        let loaded: RegressionForest<f64> = load_regression_forest(&path).unwrap();
        let _ = fs::remove_file(&path);

        let before = forest.predict(&x, false, false).unwrap();
        let after = loaded.predict(&x, false, false).unwrap();
        assert_eq!(before.data(), after.data());
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let x: Tensor<f64> = Tensor::from_vec2d(&[vec![0.0], vec![1.0]]).unwrap();
        let y: Tensor<f64> = Tensor::from_vec2d(&[vec![0.0], vec![1.0]]).unwrap();
        let mut forest =
            ClassificationForest::<f64>::new(2, 2, 1, 2, 0, false, 1, 0, 1e-7).unwrap();
        forest.fit(&x, &y, 1, false, None).unwrap();
        let err = save_classification_forest(&forest, tmp_path("model.bin"));
        assert!(err.is_err());
    }
}
