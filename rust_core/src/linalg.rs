//! Dense linear algebra over flat row-major buffers.
//!
//! Every function here is pure and allocation-local. This module is the
//! only place where ill-conditioning is detected and surfaced; callers
//! either handle `SingularMatrix` by regularizing or propagate it.

use crate::error::{Error, Result};

/// Pivot magnitudes below this are treated as singular in `solve`.
pub const DEFAULT_PIVOT_TOL: f64 = 1e-12;

/// Cholesky factorization of a symmetric positive-definite matrix.
///
/// Returns the lower-triangular factor L (row-major, upper triangle zeroed)
/// with A = L·Lᵀ, or `SingularMatrix` on a non-positive pivot.
pub fn cholesky(a: &[f64], n: usize) -> Result<Vec<f64>> {
    debug_assert_eq!(a.len(), n * n);
    let mut l = vec![0.0; n * n];

    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return Err(Error::SingularMatrix(format!(
                        "non-positive pivot {} at row {}",
                        sum, i
                    )));
                }
                l[i * n + i] = sum.sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }

    Ok(l)
}

/// Solve L·Lᵀ·x = b given a lower-triangular Cholesky factor.
pub fn cholesky_solve(l: &[f64], n: usize, b: &[f64]) -> Vec<f64> {
    let y = forward_substitute(l, n, b);
    back_substitute_transposed(l, n, &y)
}

/// Solve L·y = b for lower-triangular L.
pub fn forward_substitute(l: &[f64], n: usize, b: &[f64]) -> Vec<f64> {
    let mut y = vec![0.0; n];
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[i * n + k] * y[k];
        }
        y[i] = sum / l[i * n + i];
    }
    y
}

/// Solve Lᵀ·x = y for lower-triangular L.
pub fn back_substitute_transposed(l: &[f64], n: usize, y: &[f64]) -> Vec<f64> {
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = y[i];
        for k in i + 1..n {
            sum -= l[k * n + i] * x[k];
        }
        x[i] = sum / l[i * n + i];
    }
    x
}

/// Sum of log-diagonal entries of a Cholesky factor; ½·ln det A.
pub fn half_log_det(l: &[f64], n: usize) -> f64 {
    (0..n).map(|i| l[i * n + i].ln()).sum()
}

/// Solve A·x = b by LU decomposition with partial pivoting.
///
/// A pivot with magnitude below `pivot_tol` reports `SingularMatrix`.
pub fn solve(a: &[f64], n: usize, b: &[f64], pivot_tol: f64) -> Result<Vec<f64>> {
    debug_assert_eq!(a.len(), n * n);
    debug_assert_eq!(b.len(), n);
    let mut m = a.to_vec();
    let mut x = b.to_vec();

    for col in 0..n {
        let mut pivot_row = col;
        let mut pivot_mag = m[col * n + col].abs();
        for r in col + 1..n {
            let mag = m[r * n + col].abs();
            if mag > pivot_mag {
                pivot_mag = mag;
                pivot_row = r;
            }
        }
        if pivot_mag < pivot_tol || !pivot_mag.is_finite() {
            return Err(Error::SingularMatrix(format!(
                "pivot magnitude {} below tolerance {} at column {}",
                pivot_mag, pivot_tol, col
            )));
        }
        if pivot_row != col {
            for k in 0..n {
                m.swap(col * n + k, pivot_row * n + k);
            }
            x.swap(col, pivot_row);
        }

        for r in col + 1..n {
            let factor = m[r * n + col] / m[col * n + col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                m[r * n + k] -= factor * m[col * n + k];
            }
            x[r] -= factor * x[col];
        }
    }

    for i in (0..n).rev() {
        let mut sum = x[i];
        for k in i + 1..n {
            sum -= m[i * n + k] * x[k];
        }
        x[i] = sum / m[i * n + i];
    }

    Ok(x)
}

/// Least-squares fit of `y` on the given predictor columns plus an
/// intercept, via the normal equations. Coefficient 0 is the intercept,
/// coefficient i+1 belongs to `columns[i]`.
///
/// A singular Gram matrix (collinear predictors) is retried once with a
/// small ridge on the diagonal before reporting `SingularMatrix`.
pub fn least_squares(columns: &[&[f64]], y: &[f64]) -> Result<Vec<f64>> {
    let n = y.len();
    let p = columns.len() + 1;
    for c in columns {
        if c.len() != n {
            return Err(Error::ShapeMismatch(format!(
                "predictor column has {} rows, response has {}",
                c.len(),
                n
            )));
        }
    }

    // Gram matrix XᵀX and right-hand side Xᵀy, with X = [1 | columns].
    let x_at = |row: usize, j: usize| -> f64 {
        if j == 0 {
            1.0
        } else {
            columns[j - 1][row]
        }
    };
    let mut gram = vec![0.0; p * p];
    let mut rhs = vec![0.0; p];
    for r in 0..n {
        for i in 0..p {
            let xi = x_at(r, i);
            rhs[i] += xi * y[r];
            for j in i..p {
                gram[i * p + j] += xi * x_at(r, j);
            }
        }
    }
    for i in 0..p {
        for j in 0..i {
            gram[i * p + j] = gram[j * p + i];
        }
    }

    match solve(&gram, p, &rhs, DEFAULT_PIVOT_TOL) {
        Ok(beta) => Ok(beta),
        Err(_) => {
            let trace: f64 = (0..p).map(|i| gram[i * p + i]).sum();
            let ridge = 1e-8 * (trace / p as f64).max(1.0);
            let mut regularized = gram;
            for i in 0..p {
                regularized[i * p + i] += ridge;
            }
            solve(&regularized, p, &rhs, DEFAULT_PIVOT_TOL)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_cholesky_known_factor() {
        // A = [[4, 2], [2, 3]] => L = [[2, 0], [1, sqrt(2)]]
        let l = cholesky(&[4.0, 2.0, 2.0, 3.0], 2).unwrap();
        assert_abs_diff_eq!(l[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(l[1], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(l[2], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(l[3], 2.0_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_cholesky_rejects_indefinite() {
        let err = cholesky(&[1.0, 2.0, 2.0, 1.0], 2).unwrap_err();
        assert!(matches!(err, Error::SingularMatrix(_)));
    }

    #[test]
    fn test_cholesky_solve_round_trip() {
        let a = [4.0, 2.0, 2.0, 3.0];
        let l = cholesky(&a, 2).unwrap();
        let x = cholesky_solve(&l, 2, &[8.0, 7.0]);
        // A·x should reproduce b
        assert_abs_diff_eq!(4.0 * x[0] + 2.0 * x[1], 8.0, epsilon = 1e-10);
        assert_abs_diff_eq!(2.0 * x[0] + 3.0 * x[1], 7.0, epsilon = 1e-10);
    }

    #[test]
    fn test_solve_known_system() {
        // 2x + y = 5, x - y = 1 => x = 2, y = 1
        let x = solve(&[2.0, 1.0, 1.0, -1.0], 2, &[5.0, 1.0], DEFAULT_PIVOT_TOL).unwrap();
        assert_abs_diff_eq!(x[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_solve_reports_singular() {
        let err = solve(&[1.0, 2.0, 2.0, 4.0], 2, &[1.0, 2.0], DEFAULT_PIVOT_TOL).unwrap_err();
        assert!(matches!(err, Error::SingularMatrix(_)));
    }

    #[test]
    fn test_least_squares_recovers_line() {
        let xs: Vec<f64> = (0..50).map(|i| i as f64 * 0.1).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 3.0 + 2.0 * x).collect();
        let beta = least_squares(&[xs.as_slice()], &ys).unwrap();
        assert_abs_diff_eq!(beta[0], 3.0, epsilon = 1e-8);
        assert_abs_diff_eq!(beta[1], 2.0, epsilon = 1e-8);
    }

    #[test]
    fn test_least_squares_collinear_predictors() {
        // Duplicated predictor: Gram matrix singular, ridge retry kicks in.
        let xs: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 1.0 + x).collect();
        let beta = least_squares(&[xs.as_slice(), xs.as_slice()], &ys).unwrap();
        // The ridge splits the slope between the duplicated columns.
        assert_abs_diff_eq!(beta[1] + beta[2], 1.0, epsilon = 1e-4);
    }
}
