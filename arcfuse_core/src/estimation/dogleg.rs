// arcfuse_core/src/estimation/dogleg.rs

use nalgebra::{DMatrix, DVector};
use tracing::{debug, info};

use super::convergence::{finite_cost, stop_after_step, stop_before_step, SolverReport, Termination};
use super::diagnostics::solve_normal;
use super::levenberg_marquardt::gain_ratio;
use super::problem::Problem;
use super::{Solved, Solver};
use crate::config::SolverConfig;
use crate::error::FusionResult;
use crate::layout::Layout;
use crate::retraction::Estimate;

/// Radius factor applied when the model predicts the cost poorly.
const SHRINK_FACTOR: f64 = 0.25;
/// Radius factor applied when a step on the boundary predicts well.
const GROW_FACTOR: f64 = 2.0;

/// Powell's dogleg trust-region method.
#[derive(Debug, Clone)]
pub struct Dogleg {
    config: SolverConfig,
}

impl Dogleg {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }
}

/// Combines the Gauss-Newton step and the Cauchy point inside `radius`.
pub fn dogleg_step(
    gauss_newton: &DVector<f64>,
    gradient: &DVector<f64>,
    jacobian: &DMatrix<f64>,
    radius: f64,
) -> DVector<f64> {
    if gauss_newton.norm() <= radius {
        return gauss_newton.clone();
    }
    let gradient_norm = gradient.norm();
    let curvature = (jacobian * gradient).norm_squared();
    if gradient_norm == 0.0 || curvature == 0.0 {
        return gauss_newton * (radius / gauss_newton.norm());
    }

    // Minimizer of the model along the steepest descent direction.
    let cauchy = gradient * (-gradient_norm * gradient_norm / curvature);
    if cauchy.norm() >= radius {
        return gradient * (-radius / gradient_norm);
    }

    // Walk from the Cauchy point towards the Gauss-Newton step up to the boundary.
    let leg = gauss_newton - &cauchy;
    let a = leg.norm_squared();
    let b = 2.0 * cauchy.dot(&leg);
    let c = cauchy.norm_squared() - radius * radius;
    let beta = (-b + (b * b - 4.0 * a * c).max(0.0).sqrt()) / (2.0 * a);
    cauchy + leg * beta
}

impl Solver for Dogleg {
    fn solve(&self, problem: &Problem, estimate: Estimate, layout: &Layout) -> FusionResult<Solved> {
        let config = &self.config;
        let mut estimate = estimate;
        let mut linearization = problem.linearize(&estimate, layout)?;
        let mut report = SolverReport::new(finite_cost(linearization.cost(), 0)?);
        let mut radius = config.initial_radius.min(config.radius_max);

        let termination = loop {
            let cost = linearization.cost();
            if let Some(reason) = stop_before_step(config, cost, report.iterations) {
                break reason;
            }

            // --- 1. Dogleg step ---
            let gradient = linearization.gradient();
            let gauss_newton = solve_normal(&linearization.information(), &-&gradient)?;
            let step = dogleg_step(&gauss_newton, &gradient, &linearization.jacobian, radius);
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
                radius,
                "dogleg trial"
            );

            // --- 3. Radius update ---
            let step_norm = step.norm();
            if rho < config.shrink_threshold {
                radius *= SHRINK_FACTOR;
            } else if rho > config.grow_threshold && step_norm >= 0.99 * radius {
                radius = (radius * GROW_FACTOR).min(config.radius_max);
            }

            // --- 4. Accept or reject ---
            if rho > config.gain_threshold {
                report.accept(trial_cost, &outcome.reintegrated);
                estimate = trial;
                linearization = trial_linearization;
                if let Some(reason) = stop_after_step(config, cost, trial_cost, step_norm) {
                    break reason;
                }
            } else {
                report.rejected_steps += 1;
            }
            if radius < config.radius_floor {
                break Termination::RadiusCollapsed;
            }
        };

        report.termination = termination;
        info!(
            iterations = report.iterations,
            rejected = report.rejected_steps,
            initial_cost = report.initial_cost,
            final_cost = report.final_cost,
            %termination,
            "dogleg finished"
        );
        Ok(Solved {
            estimate,
            linearization,
            report,
        })
    }
}
