// arcfuse_core/src/estimation/gauss_newton.rs

use tracing::{debug, info};

use super::convergence::{finite_cost, stop_after_step, stop_before_step, OscillationDetector, SolverReport, Termination};
use super::diagnostics::solve_normal;
use super::problem::Problem;
use super::{Solved, Solver};
use crate::config::SolverConfig;
use crate::error::FusionResult;
use crate::layout::Layout;
use crate::retraction::Estimate;

/// Undamped Gauss-Newton: every step `JᵀJ h = −Jᵀr` is taken.
#[derive(Debug, Clone)]
pub struct GaussNewton {
    config: SolverConfig,
}

impl GaussNewton {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }
}

impl Solver for GaussNewton {
    fn solve(&self, problem: &Problem, estimate: Estimate, layout: &Layout) -> FusionResult<Solved> {
        let config = &self.config;
        let mut estimate = estimate;
        let mut linearization = problem.linearize(&estimate, layout)?;
        let mut report = SolverReport::new(finite_cost(linearization.cost(), 0)?);
        let mut oscillation = OscillationDetector::new(config);
        oscillation.push(linearization.cost());

        let termination = loop {
            let cost = linearization.cost();
            if let Some(reason) = stop_before_step(config, cost, report.iterations) {
                break reason;
            }

            let step = solve_normal(&linearization.information(), &-linearization.gradient())?;
            let (next, outcome) = problem.retract(&estimate, &step, layout, false)?;
            let next_linearization = problem.linearize(&next, layout)?;
            report.iterations += 1;

            let next_cost = finite_cost(next_linearization.cost(), report.iterations)?;
            debug!(
                iteration = report.iterations,
                cost = next_cost,
                step = step.norm(),
                reintegrated = outcome.reintegrated.len(),
                "gauss-newton step"
            );
            report.accept(next_cost, &outcome.reintegrated);
            estimate = next;
            linearization = next_linearization;

            if let Some(reason) = stop_after_step(config, cost, next_cost, step.norm()) {
                break reason;
            }
            if oscillation.push(next_cost) {
                break Termination::Oscillation;
            }
        };

        report.termination = termination;
        info!(
            iterations = report.iterations,
            initial_cost = report.initial_cost,
            final_cost = report.final_cost,
            %termination,
            "gauss-newton finished"
        );
        Ok(Solved {
            estimate,
            linearization,
            report,
        })
    }
}
