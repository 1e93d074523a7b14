//! # Linear Algebra Utilities
//!
//! Full-pivot Gauss-Jordan elimination with simultaneous inversion, and the
//! expansion of a compacted covariance matrix back to parameter space.

use crate::parameters::CompactIndex;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of a linear solve. Singular systems are reported, never thrown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    Ok,
    /// A zero pivot remained after full pivoting. Usually a parameter marked
    /// varying that no observation constrains.
    SingularExactZero,
    /// A negative diagonal element. Usually too few observations for the
    /// number of varying parameters.
    SingularNegative,
}

#[derive(Error, Debug)]
pub enum LinalgError {
    #[error("Matrix is {rows}x{cols}, but the compact index describes {expected} varying parameters.")]
    ShapeMismatch {
        rows: usize,
        cols: usize,
        expected: usize,
    },
}

/// Classifies the diagonal of a matrix before it is handed to the solver.
pub fn diagonal_status(matrix: &Array2<f64>) -> SolveStatus {
    let mut status = SolveStatus::Ok;
    for &d in matrix.diag() {
        if d < 0.0 {
            return SolveStatus::SingularNegative;
        }
        if d == 0.0 {
            status = SolveStatus::SingularExactZero;
        }
    }
    status
}

/// Solves `a * x = b` for a single right-hand side by Gauss-Jordan
/// elimination with full pivoting. On success `a` holds its inverse and `b`
/// holds `x`.
pub fn gauss_jordan_solve(a: &mut Array2<f64>, b: &mut Array1<f64>) -> SolveStatus {
    let n = a.nrows();
    debug_assert_eq!(a.ncols(), n);
    debug_assert_eq!(b.len(), n);

    let mut row_of = vec![0usize; n];
    let mut col_of = vec![0usize; n];
    let mut pivot_count = vec![0u32; n];

    for i in 0..n {
        // --- 1. Find the largest remaining element ---
        let mut big = 0.0;
        let mut pivot: Option<(usize, usize)> = None;
        for j in 0..n {
            if pivot_count[j] == 1 {
                continue;
            }
            for k in 0..n {
                match pivot_count[k] {
                    0 => {
                        let magnitude = a[[j, k]].abs();
                        if magnitude >= big {
                            big = magnitude;
                            pivot = Some((j, k));
                        }
                    }
                    1 => {}
                    _ => return SolveStatus::SingularExactZero,
                }
            }
        }
        let Some((irow, icol)) = pivot else {
            return SolveStatus::SingularExactZero;
        };
        pivot_count[icol] += 1;

        // --- 2. Move the pivot onto the diagonal ---
        if irow != icol {
            for l in 0..n {
                a.swap([irow, l], [icol, l]);
            }
            b.swap(irow, icol);
        }
        row_of[i] = irow;
        col_of[i] = icol;

        if a[[icol, icol]] == 0.0 {
            return SolveStatus::SingularExactZero;
        }

        // --- 3. Normalise the pivot row and eliminate the column ---
        let inverse_pivot = 1.0 / a[[icol, icol]];
        a[[icol, icol]] = 1.0;
        for l in 0..n {
            a[[icol, l]] *= inverse_pivot;
        }
        b[icol] *= inverse_pivot;

        for ll in 0..n {
            if ll == icol {
                continue;
            }
            let factor = a[[ll, icol]];
            a[[ll, icol]] = 0.0;
            for l in 0..n {
                a[[ll, l]] -= a[[icol, l]] * factor;
            }
            b[ll] -= b[icol] * factor;
        }
    }

    // --- 4. Undo the column interchanges in reverse order ---
    for l in (0..n).rev() {
        if row_of[l] != col_of[l] {
            for k in 0..n {
                a.swap([k, row_of[l]], [k, col_of[l]]);
            }
        }
    }
    SolveStatus::Ok
}

/// Solves the normal equations of a least-squares problem. The diagonal is
/// scanned first, then `gauss_jordan_solve` runs, and the inverse left in
/// `a` must have a non-negative diagonal: a negative variance means the
/// elimination broke down numerically and is reported as `SingularNegative`.
pub fn solve_curvature(a: &mut Array2<f64>, b: &mut Array1<f64>) -> SolveStatus {
    let status = diagonal_status(a);
    if status != SolveStatus::Ok {
        return status;
    }
    match gauss_jordan_solve(a, b) {
        SolveStatus::Ok if a.diag().iter().any(|&d| d < 0.0) => SolveStatus::SingularNegative,
        status => status,
    }
}

/// Scatters a compacted `m x m` covariance into the full
/// `(n + 1) x (n + 1)` parameter space. Rows and columns of fixed parameters,
/// and of the unused index 0, stay zero.
pub fn covariance_expand(
    covariance: &Array2<f64>,
    compact: &CompactIndex,
) -> Result<Array2<f64>, LinalgError> {
    let m = compact.len();
    if covariance.dim() != (m, m) {
        return Err(LinalgError::ShapeMismatch {
            rows: covariance.nrows(),
            cols: covariance.ncols(),
            expected: m,
        });
    }
    let n = compact.storage_len();
    let mut expanded = Array2::zeros((n, n));
    let globals = compact.globals();
    for (j, &gj) in globals.iter().enumerate() {
        for (k, &gk) in globals.iter().enumerate() {
            expanded[[gj, gk]] = covariance[[j, k]];
        }
    }
    Ok(expanded)
}
