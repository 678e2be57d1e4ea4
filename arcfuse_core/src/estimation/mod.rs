// arcfuse_core/src/estimation/mod.rs

//! Batch estimation: the stacked least-squares problem, the solvers that
//! minimize it and the estimator that orchestrates a fusion run.

use std::fmt::Debug;

use crate::config::{SolverConfig, SolverKind};
use crate::error::FusionResult;
use crate::layout::Layout;
use crate::retraction::Estimate;

pub mod convergence;
pub mod diagnostics;
pub mod dogleg;
pub mod estimator;
#[cfg(test)]
pub(crate) mod fixtures;
pub mod gauss_newton;
pub mod levenberg_marquardt;
pub mod problem;

pub use convergence::{SolverReport, Termination};
pub use dogleg::Dogleg;
pub use estimator::{Estimator, FusionSolution};
pub use gauss_newton::GaussNewton;
pub use levenberg_marquardt::LevenbergMarquardt;
pub use problem::{Linearization, Problem};

/// The result of one solver run.
#[derive(Debug, Clone)]
pub struct Solved {
    pub estimate: Estimate,
    /// Linearization at `estimate`.
    pub linearization: Linearization,
    pub report: SolverReport,
}

/// The contract for any algorithm minimizing the stacked cost `½‖r‖²`.
///
/// A solver takes ownership of the starting estimate and hands back the one it
/// ended on; trial estimates it rejects are never observable.
pub trait Solver: Debug + Send + Sync {
    fn solve(&self, problem: &Problem, estimate: Estimate, layout: &Layout) -> FusionResult<Solved>;
}

/// The solver selected by the configuration.
pub fn solver_for(config: &SolverConfig) -> Box<dyn Solver> {
    match config.kind {
        SolverKind::GaussNewton => Box::new(GaussNewton::new(config.clone())),
        SolverKind::LevenbergMarquardt => Box::new(LevenbergMarquardt::new(config.clone())),
        SolverKind::TrustRegion => Box::new(Dogleg::new(config.clone())),
    }
}
