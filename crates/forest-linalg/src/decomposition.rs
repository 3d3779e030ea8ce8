use forest_core::{Float, ForestError, Tensor};

/// QR decomposition result: `A = Q * R`.
pub struct QrDecomposition<T: Float> {
    pub q: Tensor<T>,
    pub r: Tensor<T>,
}

/// Column-pivoted QR: `A * P = Q * R`, with `rank` the number of
/// columns whose Householder step produced a sub-diagonal norm above
/// the numerical-rank tolerance. Columns are reordered by `pivot` (a
/// permutation of `0..n`) so that `R`'s leading `rank` diagonal entries
/// are the large ones.
pub struct PivotedQr<T: Float> {
    pub q: Tensor<T>,
    pub r: Tensor<T>,
    pub pivot: Vec<usize>,
    pub rank: usize,
}

/// Unpivoted Householder QR of an `m x n` matrix, `m >= n` or `m < n`.
pub fn qr<T: Float>(a: &Tensor<T>) -> Result<QrDecomposition<T>, ForestError> {
    if a.ndim() != 2 {
        return Err(ForestError::Shape("qr requires a 2D tensor".into()));
    }
    let m = a.shape().dim(0)?;
    let n = a.shape().dim(1)?;
    let k = m.min(n);

    let mut r_data = a.data().to_vec();
    let mut q_data = vec![T::ZERO; m * m];
    for i in 0..m {
        q_data[i * m + i] = T::ONE;
    }

    for j in 0..k {
        householder_step(&mut r_data, &mut q_data, m, n, j);
    }

    Ok(QrDecomposition {
        q: Tensor::new(q_data, vec![m, m])?,
        r: Tensor::new(r_data, vec![m, n])?,
    })
}

/// Column-pivoted Householder QR, revealing numerical rank.
///
/// Ground truth: same Householder elimination as `qr`, but at each step
/// the remaining column with the largest norm is swapped to the front
/// before eliminating, so that the diagonal of `R` decreases in
/// magnitude. `rank` is the count of pivots whose diagonal magnitude
/// exceeds `tol`; the remaining `n - rank` columns are numerically
/// dependent on the first `rank`.
pub fn qr_column_pivoted<T: Float>(
    a: &Tensor<T>,
    tol: T,
) -> Result<PivotedQr<T>, ForestError> {
    if a.ndim() != 2 {
        return Err(ForestError::Shape("qr_column_pivoted requires a 2D tensor".into()));
    }
    let m = a.shape().dim(0)?;
    let n = a.shape().dim(1)?;
    let k = m.min(n);

    let mut r_data = a.data().to_vec();
    let mut q_data = vec![T::ZERO; m * m];
    for i in 0..m {
        q_data[i * m + i] = T::ONE;
    }
    let mut pivot: Vec<usize> = (0..n).collect();

    // Running squared column norms over the *remaining* row range, used
    // to pick the pivot column at each step without rescanning rows 0..j
    // every time.
    let mut col_norms2: Vec<T> = (0..n)
        .map(|col| (0..m).map(|row| r_data[row * n + col] * r_data[row * n + col]).sum())
        .collect();

    let mut rank = 0usize;
    for j in 0..k {
        // Select the remaining column with the largest norm.
        let mut best = j;
        let mut best_norm = col_norms2[j];
        for c in (j + 1)..n {
            if col_norms2[c] > best_norm {
                best_norm = col_norms2[c];
                best = c;
            }
        }
        if best != j {
            for row in 0..m {
                r_data.swap(row * n + j, row * n + best);
            }
            col_norms2.swap(j, best);
            pivot.swap(j, best);
        }

        householder_step(&mut r_data, &mut q_data, m, n, j);

        // Downdate norms of the columns to the right of j (norm of the
        // part below the new diagonal only; diagonal entry itself is
        // the post-elimination R[j][j]).
        for c in (j + 1)..n {
            let mut s = T::ZERO;
            for row in (j + 1)..m {
                s += r_data[row * n + c] * r_data[row * n + c];
            }
            col_norms2[c] = s;
        }

        if r_data[j * n + j].abs() > tol {
            rank = j + 1;
        }
    }
    // Any trailing dimensions beyond k never got a pivot step at all;
    // rank cannot exceed k regardless.
    rank = rank.min(k);

    Ok(PivotedQr {
        q: Tensor::new(q_data, vec![m, m])?,
        r: Tensor::new(r_data, vec![m, n])?,
        pivot,
        rank,
    })
}

/// Apply one Householder elimination step to column `j`, updating both
/// the working `R` (`m x n`, row-major) and accumulating into `Q`
/// (`m x m`, row-major) so that `Q` stays orthogonal throughout.
fn householder_step<T: Float>(
    r_data: &mut [T],
    q_data: &mut [T],
    m: usize,
    n: usize,
    j: usize,
) {
    let mut x = vec![T::ZERO; m - j];
    for i in j..m {
        x[i - j] = r_data[i * n + j];
    }

    let mut norm_x = T::ZERO;
    for &v in &x {
        norm_x += v * v;
    }
    norm_x = norm_x.sqrt();
    if norm_x < T::EPSILON {
        return;
    }

    let sign = if x[0] >= T::ZERO { T::ONE } else { T::NEG_ONE };
    x[0] += sign * norm_x;

    let mut norm_v = T::ZERO;
    for &v in &x {
        norm_v += v * v;
    }
    norm_v = norm_v.sqrt();
    if norm_v < T::EPSILON {
        return;
    }
    for v in x.iter_mut() {
        *v = *v / norm_v;
    }

    // Apply H = I - 2*v*v^T to R (columns j..n).
    for col in j..n {
        let mut dot = T::ZERO;
        for i in j..m {
            dot += x[i - j] * r_data[i * n + col];
        }
        for i in j..m {
            r_data[i * n + col] -= T::TWO * x[i - j] * dot;
        }
    }

    // Accumulate H into Q (Q := Q * H), applied on the right to all rows.
    for row in 0..m {
        let mut dot = T::ZERO;
        for i in j..m {
            dot += q_data[row * m + i] * x[i - j];
        }
        for i in j..m {
            q_data[row * m + i] -= T::TWO * dot * x[i - j];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_reconstructs_a() {
        let a: Tensor<f64> =
            Tensor::from_vec2d(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap();
        let d = qr(&a).unwrap();
        // Q*R should reconstruct A within float tolerance.
        let m = 3;
        let n = 2;
        for i in 0..m {
            for col in 0..n {
                let mut sum = 0.0;
                for kk in 0..m {
                    sum += d.q.get(&[i, kk]).unwrap() * d.r.get(&[kk, col]).unwrap();
                }
                assert!((sum - a.get(&[i, col]).unwrap()).abs() < 1e-8);
            }
        }
    }

    #[test]
    fn pivoted_qr_detects_rank_deficiency() {
        // Third column is a linear combination of the first two.
        let a: Tensor<f64> = Tensor::from_vec2d(&[
            vec![1.0, 0.0, 1.0],
            vec![0.0, 1.0, 1.0],
            vec![1.0, 1.0, 2.0],
            vec![2.0, 1.0, 3.0],
        ])
        .unwrap();
        let d = qr_column_pivoted(&a, 1e-7).unwrap();
        assert_eq!(d.rank, 2);
    }

    #[test]
    fn pivoted_qr_full_rank() {
        let a: Tensor<f64> =
            Tensor::from_vec2d(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]]).unwrap();
        let d = qr_column_pivoted(&a, 1e-7).unwrap();
        assert_eq!(d.rank, 2);
    }
}
