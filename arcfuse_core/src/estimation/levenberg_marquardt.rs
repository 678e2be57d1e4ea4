// arcfuse_core/src/estimation/levenberg_marquardt.rs

use tracing::{debug, info};

use super::convergence::{finite_cost, stop_after_step, stop_before_step, SolverReport, Termination};
use super::diagnostics::solve_normal;
use super::problem::Problem;
use super::{Solved, Solver};
use crate::config::SolverConfig;
use crate::error::FusionResult;
use crate::layout::Layout;
use crate::retraction::Estimate;

/// Levenberg-Marquardt with Marquardt's diagonal scaling,
/// `(JᵀJ + λ·diag(JᵀJ)) h = −Jᵀr`.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    config: SolverConfig,
}

impl LevenbergMarquardt {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }
}

/// Actual over predicted cost reduction; non-positive predictions and trials
/// whose cost is not finite never pass.
pub(crate) fn gain_ratio(actual: f64, predicted: f64) -> f64 {
    if predicted > 0.0 && actual.is_finite() {
        actual / predicted
    } else {
        f64::NEG_INFINITY
    }
}

impl Solver for LevenbergMarquardt {
    fn solve(&self, problem: &Problem, estimate: Estimate, layout: &Layout) -> FusionResult<Solved> {
        let config = &self.config;
        let mut estimate = estimate;
        let mut linearization = problem.linearize(&estimate, layout)?;
        let mut report = SolverReport::new(finite_cost(linearization.cost(), 0)?);
        let mut lambda = config.initial_lambda.clamp(config.lambda_min, config.lambda_max);

        let termination = loop {
            let cost = linearization.cost();
            if let Some(reason) = stop_before_step(config, cost, report.iterations) {
                break reason;
            }

            // --- 1. Damped step ---
            let information = linearization.information();
            let mut damped = information.clone();
            for k in 0..damped.nrows() {
                damped[(k, k)] += lambda * information[(k, k)];
            }
            let step = solve_normal(&damped, &-linearization.gradient())?;
            report.iterations += 1;

            // --- 2. Trial and gain ratio ---
            let (trial, outcome) = problem.retract(&estimate, &step, layout, false)?;
            let trial_linearization = problem.linearize(&trial, layout)?;
            let trial_cost = trial_linearization.cost();
            let rho = gain_ratio(cost - trial_cost, linearization.predicted_reduction(&step));
            debug!(
                iteration = report.iterations,
                cost = trial_cost,
                rho,
                lambda,
                "levenberg-marquardt trial"
            );

            // --- 3. Accept or reject ---
            if rho > config.gain_threshold {
                report.accept(trial_cost, &outcome.reintegrated);
                estimate = trial;
                linearization = trial_linearization;
                lambda = (lambda / config.lambda_decrease).max(config.lambda_min);
                if let Some(reason) = stop_after_step(config, cost, trial_cost, step.norm()) {
                    break reason;
                }
            } else {
                report.rejected_steps += 1;
                if lambda >= config.lambda_max {
                    break Termination::DampingLimit;
                }
                lambda = (lambda * config.lambda_increase).min(config.lambda_max);
            }
        };

        report.termination = termination;
        info!(
            iterations = report.iterations,
            rejected = report.rejected_steps,
            initial_cost = report.initial_cost,
            final_cost = report.final_cost,
            %termination,
            "levenberg-marquardt finished"
        );
        Ok(Solved {
            estimate,
            linearization,
            report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FusionMode, SolverKind};
    use crate::estimation::fixtures::drive;

    fn config(gain_threshold: f64) -> SolverConfig {
        SolverConfig {
            kind: SolverKind::LevenbergMarquardt,
            max_iterations: 3,
            gain_threshold,
            ..SolverConfig::default()
        }
    }

    #[test]
    fn rejected_trials_leave_the_estimate_untouched() {
        // No gain ratio passes an infinite threshold.
        let config = config(f64::INFINITY);
        let (problem, estimate, layout) = drive(FusionMode::Full, config.clone());
        let solved = LevenbergMarquardt::new(config)
            .solve(&problem, estimate.clone(), &layout)
            .unwrap();

        assert_eq!(solved.report.rejected_steps, 3);
        assert_eq!(solved.report.termination, Termination::MaxIterations);
        assert_eq!(solved.report.final_cost, solved.report.initial_cost);
        assert_eq!(solved.estimate, estimate);
        assert_eq!(solved.estimate.biases, estimate.biases);
        assert_eq!(solved.estimate.clusters, estimate.clusters);
        assert_eq!(solved.estimate.segments, estimate.segments);
    }

    #[test]
    fn accepted_trials_move_states_and_segments() {
        let config = config(SolverConfig::default().gain_threshold);
        let (problem, estimate, layout) = drive(FusionMode::Full, config.clone());
        let solved = LevenbergMarquardt::new(config)
            .solve(&problem, estimate.clone(), &layout)
            .unwrap();

        assert!(solved.report.final_cost < solved.report.initial_cost);
        assert_ne!(solved.estimate.states, estimate.states);
        assert_ne!(solved.estimate.segments, estimate.segments);
    }

    #[test]
    fn gain_ratio_refuses_non_descent_predictions() {
        assert_eq!(gain_ratio(1.0, 2.0), 0.5);
        assert_eq!(gain_ratio(1.0, 0.0), f64::NEG_INFINITY);
        assert_eq!(gain_ratio(-1.0, -2.0), f64::NEG_INFINITY);
        assert_eq!(gain_ratio(f64::NAN, 2.0), f64::NEG_INFINITY);
        assert_eq!(gain_ratio(f64::NEG_INFINITY, 2.0), f64::NEG_INFINITY);
    }
}
