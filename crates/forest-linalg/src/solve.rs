use forest_core::{Float, ForestError, Tensor};

use crate::decomposition::{qr, qr_column_pivoted};

/// Solve the upper-triangular system `r * x = b` by back substitution.
/// `r` is `k x k`, row-major; `b` has length `k`.
fn solve_upper_triangular<T: Float>(r: &[T], k: usize, stride: usize, b: &[T]) -> Result<Vec<T>, ForestError> {
    let mut x = vec![T::ZERO; k];
    for i in (0..k).rev() {
        let mut sum = T::ZERO;
        for j in (i + 1)..k {
            sum += r[i * stride + j] * x[j];
        }
        let diag = r[i * stride + i];
        if diag.abs() < T::EPSILON {
            return Err(ForestError::NoSolution(format!(
                "singular triangular system at row {i}"
            )));
        }
        x[i] = (b[i] - sum) / diag;
    }
    Ok(x)
}

/// Ordinary least squares via (unpivoted) QR, assuming `a` (`m x n`,
/// `m >= n`) has full column rank.
pub fn lstsq_full_rank<T: Float>(a: &Tensor<T>, y: &[T]) -> Result<Vec<T>, ForestError> {
    let m = a.shape().dim(0)?;
    let n = a.shape().dim(1)?;
    if y.len() != m {
        return Err(ForestError::Shape(format!(
            "lstsq: y has {} elements but A has {m} rows", y.len()
        )));
    }
    let d = qr(a)?;
    // b = Q^T y
    let mut qty = vec![T::ZERO; n];
    for row in 0..n {
        let mut sum = T::ZERO;
        for i in 0..m {
            sum += d.q.get(&[i, row])? * y[i];
        }
        qty[row] = sum;
    }
    solve_upper_triangular(d.r.data(), n, n, &qty)
}

/// Gather a subset of columns from `a` (`m x n`) into a new `m x k` matrix.
fn gather_columns<T: Float>(a: &Tensor<T>, cols: &[usize]) -> Result<Tensor<T>, ForestError> {
    let m = a.shape().dim(0)?;
    let mut data = Vec::with_capacity(m * cols.len());
    for row in 0..m {
        for &c in cols {
            data.push(a.get(&[row, c])?);
        }
    }
    Tensor::new(data, vec![m, cols.len()])
}

/// Rank-revealing least squares for the linear-regression leaf (C4):
/// run a column-pivoted QR, keep only the numerically independent
/// columns, and — since the spec requires the constant (intercept)
/// column to remain in the fit even when it is not the columns the
/// pivot happened to keep — force column `intercept_col` back into the
/// selected set if pivoting dropped it, swapping out the
/// lowest-priority selected column to make room.
///
/// Returns `(coefficients over all n original columns, rank)`, with a
/// zero coefficient for every column that didn't make the cut.
pub fn lstsq_rank_revealing<T: Float>(
    a: &Tensor<T>,
    y: &[T],
    intercept_col: usize,
    tol: T,
) -> Result<(Vec<T>, usize), ForestError> {
    let n = a.shape().dim(1)?;
    let pivoted = qr_column_pivoted(a, tol)?;
    let mut rank = pivoted.rank;
    if rank == 0 {
        return Err(ForestError::NoSolution("design matrix has rank 0".into()));
    }
    let mut selected: Vec<usize> = pivoted.pivot[..rank].to_vec();
    if rank < n && !selected.contains(&intercept_col) {
        selected[rank - 1] = intercept_col;
    }
    // Deduplicate in case the swap collided with an already-selected column.
    selected.sort_unstable();
    selected.dedup();
    rank = selected.len();

    let restricted = gather_columns(a, &selected)?;
    let coeffs_restricted = lstsq_full_rank(&restricted, y)?;

    let mut coeffs = vec![T::ZERO; n];
    for (k, &col) in selected.iter().enumerate() {
        coeffs[col] = coeffs_restricted[k];
    }
    Ok((coeffs, rank))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_rank_recovers_exact_line() {
        // y = 2 + 3x
        let a: Tensor<f64> =
            Tensor::from_vec2d(&[vec![1.0, 0.0], vec![1.0, 1.0], vec![1.0, 2.0], vec![1.0, 3.0]])
                .unwrap();
        let y = [2.0, 5.0, 8.0, 11.0];
        let coeffs = lstsq_full_rank(&a, &y).unwrap();
        assert!((coeffs[0] - 2.0).abs() < 1e-6);
        assert!((coeffs[1] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn rank_deficient_keeps_intercept() {
        // third column duplicates the second; intercept is column 0.
        let a: Tensor<f64> = Tensor::from_vec2d(&[
            vec![1.0, 0.0, 0.0],
            vec![1.0, 1.0, 1.0],
            vec![1.0, 2.0, 2.0],
            vec![1.0, 3.0, 3.0],
        ])
        .unwrap();
        let y = [2.0, 5.0, 8.0, 11.0];
        let (coeffs, rank) = lstsq_rank_revealing(&a, &y, 0, 1e-7).unwrap();
        assert_eq!(rank, 2);
        // Reconstructed fit should still predict accurately even though
        // one of the two duplicate columns has a zero coefficient.
        for (row, &target) in y.iter().enumerate() {
            let pred = coeffs[0] + coeffs[1] * a.get(&[row, 1]).unwrap() + coeffs[2] * a.get(&[row, 2]).unwrap();
            assert!((pred - target).abs() < 1e-6);
        }
    }
}
