// arcfuse_core/src/estimation/convergence.rs

//! Stop tests shared by every solver.

use std::collections::VecDeque;
use std::fmt;

use crate::config::SolverConfig;
use crate::error::{FusionError, FusionResult};

/// Why a solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Cost dropped below `cost_threshold`.
    Converged,
    /// Cost change between accepted iterates dropped below `cost_change_threshold`.
    CostStalled,
    /// Step norm dropped below `step_threshold`.
    StepTooSmall,
    MaxIterations,
    /// Gauss-Newton costs settled into a band without converging.
    Oscillation,
    /// Levenberg-Marquardt rejected a step at the largest damping.
    DampingLimit,
    /// The dogleg trust region shrank below its floor.
    RadiusCollapsed,
}

impl Termination {
    /// Whether the solver ended on a minimum rather than a budget or safeguard.
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            Termination::Converged | Termination::CostStalled | Termination::StepTooSmall
        )
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Termination::Converged => "converged",
            Termination::CostStalled => "cost stalled",
            Termination::StepTooSmall => "step too small",
            Termination::MaxIterations => "iteration limit",
            Termination::Oscillation => "oscillation",
            Termination::DampingLimit => "damping limit",
            Termination::RadiusCollapsed => "trust region collapsed",
        };
        f.write_str(text)
    }
}

/// What one solver run did.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverReport {
    /// Solved linear systems, accepted or not.
    pub iterations: usize,
    pub rejected_steps: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Cost after every accepted step, starting with the initial cost.
    pub cost_history: Vec<f64>,
    pub termination: Termination,
    /// IMU intervals re-integrated by accepted steps, in the order it happened.
    pub reintegrated: Vec<usize>,
}

impl SolverReport {
    pub(crate) fn new(initial_cost: f64) -> Self {
        Self {
            iterations: 0,
            rejected_steps: 0,
            initial_cost,
            final_cost: initial_cost,
            cost_history: vec![initial_cost],
            termination: Termination::MaxIterations,
            reintegrated: Vec::new(),
        }
    }

    pub(crate) fn accept(&mut self, cost: f64, reintegrated: &[usize]) {
        self.cost_history.push(cost);
        self.final_cost = cost;
        self.reintegrated.extend_from_slice(reintegrated);
    }
}

/// Passes a cost through unless it is NaN or infinite.
///
/// `iteration` 0 is the starting estimate.
pub(crate) fn finite_cost(cost: f64, iteration: usize) -> FusionResult<f64> {
    if cost.is_finite() {
        Ok(cost)
    } else {
        Err(FusionError::NonFiniteCost { iteration })
    }
}

/// Tests run before solving for a step.
pub(crate) fn stop_before_step(config: &SolverConfig, cost: f64, iterations: usize) -> Option<Termination> {
    if cost < config.cost_threshold {
        Some(Termination::Converged)
    } else if iterations >= config.max_iterations {
        Some(Termination::MaxIterations)
    } else {
        None
    }
}

/// Tests run after a step has been accepted.
pub(crate) fn stop_after_step(
    config: &SolverConfig,
    previous_cost: f64,
    cost: f64,
    step_norm: f64,
) -> Option<Termination> {
    if cost < config.cost_threshold {
        Some(Termination::Converged)
    } else if (previous_cost - cost).abs() < config.cost_change_threshold {
        Some(Termination::CostStalled)
    } else if step_norm < config.step_threshold {
        Some(Termination::StepTooSmall)
    } else {
        None
    }
}

/// Flags a cost sequence whose recent values all lie within
/// `relative · mean + absolute` of their mean.
#[derive(Debug, Clone)]
pub(crate) struct OscillationDetector {
    window: usize,
    relative: f64,
    absolute: f64,
    recent: VecDeque<f64>,
}

impl OscillationDetector {
    pub(crate) fn new(config: &SolverConfig) -> Self {
        Self {
            window: config.oscillation_window.max(2),
            relative: config.oscillation_relative_band,
            absolute: config.oscillation_absolute_band,
            recent: VecDeque::new(),
        }
    }

    /// Records a cost and reports whether the window now oscillates.
    pub(crate) fn push(&mut self, cost: f64) -> bool {
        self.recent.push_back(cost);
        if self.recent.len() > self.window {
            self.recent.pop_front();
        }
        if self.recent.len() < self.window {
            return false;
        }
        let mean = self.recent.iter().sum::<f64>() / self.window as f64;
        let band = self.relative * mean.abs() + self.absolute;
        self.recent.iter().all(|c| (c - mean).abs() <= band)
    }
}
