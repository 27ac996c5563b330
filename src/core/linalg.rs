//! Small dense solvers for per-pixel least squares.
//!
//! Matrices here are endmember-sized (at most a handful of rows), so plain
//! elimination with pivoting is both fast and adequate.

use ndarray::{Array2, ArrayView2};

/// Relative pivot threshold below which a system is treated as singular
pub const SINGULAR_TOLERANCE: f64 = 1e-12;

/// Invert a square matrix by Gauss-Jordan elimination with partial pivoting.
///
/// Returns `None` when a pivot falls below `tolerance` times the largest
/// absolute entry.
pub fn invert(matrix: ArrayView2<'_, f64>, tolerance: f64) -> Option<Array2<f64>> {
    let n = matrix.nrows();
    if n != matrix.ncols() {
        return None;
    }
    if n == 0 {
        return Some(Array2::zeros((0, 0)));
    }

    let scale = matrix.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return None;
    }

    let mut a = matrix.to_owned();
    let mut inv = Array2::<f64>::eye(n);

    for col in 0..n {
        let pivot_row = (col..n).max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))?;
        if a[[pivot_row, col]].abs() <= tolerance * scale {
            return None;
        }
        if pivot_row != col {
            for k in 0..n {
                a.swap([pivot_row, k], [col, k]);
                inv.swap([pivot_row, k], [col, k]);
            }
        }

        let pivot = a[[col, col]];
        a.row_mut(col).mapv_inplace(|v| v / pivot);
        inv.row_mut(col).mapv_inplace(|v| v / pivot);

        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[[row, col]];
            if factor == 0.0 {
                continue;
            }
            for k in 0..n {
                let a_ck = a[[col, k]];
                let inv_ck = inv[[col, k]];
                a[[row, k]] -= factor * a_ck;
                inv[[row, k]] -= factor * inv_ck;
            }
        }
    }

    Some(inv)
}

/// Columns of a symmetric positive semi-definite matrix that are linearly
/// independent, chosen greedily by pivoted Cholesky (largest remaining
/// Schur-complement diagonal first). Returned in ascending order.
pub fn independent_columns(gram: ArrayView2<'_, f64>, tolerance: f64) -> Vec<usize> {
    let n = gram.nrows();
    let max_diag = (0..n).map(|i| gram[[i, i]]).fold(0.0f64, f64::max);
    if max_diag <= 0.0 || !max_diag.is_finite() {
        return Vec::new();
    }

    let mut schur = gram.to_owned();
    let mut selected = Vec::with_capacity(n);

    while selected.len() < n {
        let next = (0..n)
            .filter(|i| !selected.contains(i))
            .max_by(|&i, &j| schur[[i, i]].total_cmp(&schur[[j, j]]));
        let pivot = match next {
            Some(p) if schur[[p, p]] > tolerance * max_diag => p,
            _ => break,
        };

        let pivot_value = schur[[pivot, pivot]];
        let pivot_col = schur.column(pivot).to_owned();
        for i in 0..n {
            for j in 0..n {
                schur[[i, j]] -= pivot_col[i] * pivot_col[j] / pivot_value;
            }
        }
        selected.push(pivot);
    }

    selected.sort_unstable();
    selected
}

/// Inverse of `gram` restricted to `columns`, embedded in a full-size matrix
/// with zeros for every other row and column.
///
/// Multiplying by the result gives a least-squares solution in which the
/// excluded columns get coefficient zero.
pub fn restricted_inverse(
    gram: ArrayView2<'_, f64>,
    columns: &[usize],
    tolerance: f64,
) -> Option<Array2<f64>> {
    let n = gram.nrows();
    let sub = Array2::from_shape_fn((columns.len(), columns.len()), |(i, j)| {
        gram[[columns[i], columns[j]]]
    });
    let sub_inv = invert(sub.view(), tolerance)?;

    let mut full = Array2::zeros((n, n));
    for (i, &row) in columns.iter().enumerate() {
        for (j, &col) in columns.iter().enumerate() {
            full[[row, col]] = sub_inv[[i, j]];
        }
    }
    Some(full)
}
