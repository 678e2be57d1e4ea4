// arcfuse_core/src/estimation/diagnostics.rs

//! Solving the normal equations, and explaining why they could not be solved.

use nalgebra::{DMatrix, DVector};
use tracing::error;

use crate::error::{FusionError, FusionResult, SingularityReport};

/// Diagonal entries at or below this are treated as zero.
const ZERO_DIAGONAL: f64 = 1e-12;
/// Relative tolerance under which two rows count as duplicates.
const DUPLICATE_ROW: f64 = 1e-9;

/// Scans an information matrix for unconstrained and aliased columns.
pub fn diagnose(information: &DMatrix<f64>) -> SingularityReport {
    let dim = information.nrows();
    let zero_diagonal = (0..dim)
        .filter(|&k| information[(k, k)].abs() <= ZERO_DIAGONAL)
        .collect();

    let mut duplicate_rows = Vec::new();
    for i in 0..dim {
        let row_i = information.row(i);
        let scale = row_i.amax();
        if scale <= ZERO_DIAGONAL {
            continue;
        }
        for j in (i + 1)..dim {
            let difference = (&row_i - &information.row(j)).amax();
            if difference <= DUPLICATE_ROW * scale {
                duplicate_rows.push((i, j));
            }
        }
    }

    SingularityReport {
        dim,
        zero_diagonal,
        duplicate_rows,
    }
}

/// Solves `H h = b` by Cholesky factorization.
///
/// # Errors
/// `SingularInformation`, carrying the diagnosis of `H`, when the
/// factorization fails.
pub fn solve_normal(information: &DMatrix<f64>, rhs: &DVector<f64>) -> FusionResult<DVector<f64>> {
    match information.clone().cholesky() {
        Some(cholesky) => Ok(cholesky.solve(rhs)),
        None => {
            let report = diagnose(information);
            error!(
                dim = report.dim,
                zero_diagonal = ?report.zero_diagonal,
                duplicate_rows = ?report.duplicate_rows,
                "information matrix is singular"
            );
            Err(FusionError::SingularInformation(report))
        }
    }
}
