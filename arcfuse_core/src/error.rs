// arcfuse_core/src/error.rs

use thiserror::Error;

/// Summary of why a normal-equation matrix could not be factorized.
///
/// Filled in by the singularity scan before a solver aborts, so the caller can
/// see which columns of the optimization vector are unconstrained or aliased.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SingularityReport {
    /// Dimension of the information matrix.
    pub dim: usize,
    /// Columns whose diagonal entry is (numerically) zero.
    pub zero_diagonal: Vec<usize>,
    /// Pairs of rows that are identical up to tolerance.
    pub duplicate_rows: Vec<(usize, usize)>,
}

impl std::fmt::Display for SingularityReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dim {}, {} zero diagonal entries {:?}, {} duplicate row pairs {:?}",
            self.dim,
            self.zero_diagonal.len(),
            self.zero_diagonal,
            self.duplicate_rows.len(),
            self.duplicate_rows
        )
    }
}

/// Every way a fusion run can fail.
///
/// Fit inadequacy of an arc sub-segment and rejected trial steps are *not*
/// errors; they are ordinary branches of the fitter and solver loops.
#[derive(Debug, Error)]
pub enum FusionError {
    // --- Fatal numerical errors ---
    #[error("pre-integration covariance of IMU interval {interval} is not positive definite")]
    CovarianceNotPositiveDefinite { interval: usize },

    #[error("IMU interval {interval} has no sample with positive duration")]
    EmptyImuInterval { interval: usize },

    #[error("information matrix is singular: {0}")]
    SingularInformation(SingularityReport),

    #[error("cost is not finite at iteration {iteration}")]
    NonFiniteCost { iteration: usize },

    // --- Fatal data errors ---
    #[error("lane point {point} of segment {segment} has no matching preview candidate")]
    LanePointUnmatched { segment: usize, point: usize },

    #[error("anchor of node {node} in segment {segment} could not be linearized")]
    AnchorNotLinearizable { segment: usize, node: usize },

    #[error("segment {segment}: expected {expected} entries, found {actual}")]
    SegmentSizeMismatch {
        segment: usize,
        expected: usize,
        actual: usize,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Convenience alias used throughout the crate.
pub type FusionResult<T> = Result<T, FusionError>;
