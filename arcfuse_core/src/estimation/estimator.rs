// arcfuse_core/src/estimation/estimator.rs

//! One batch fusion run, from raw inputs to the solved trajectory.

use nalgebra::{DMatrix, DVector};
use tracing::{debug, info, warn};

use super::problem::{Linearization, Problem};
use super::{solver_for, SolverReport, Solver};
use crate::config::{FusionConfig, FusionMode};
use crate::error::{FusionError, FusionResult};
use crate::factors::gnss::GnssTarget;
use crate::factors::inertial::gravity_vector;
use crate::factors::prior::PriorValues;
use crate::factors::{ForwardDifference, LaneJacobian};
use crate::frames::{GeodeticPoint, LocalFrame};
use crate::imu::{ImuCluster, ImuNoise};
use crate::lane::association::positions;
use crate::lane::{locate_points, ArcFitter, ArcSegment, FitReport};
use crate::layout::{Capabilities, Layout};
use crate::messages::FusionInputs;
use crate::retraction::Estimate;
use crate::types::{Bias, State};

/// Everything a fusion run produces.
#[derive(Debug, Clone)]
pub struct FusionSolution {
    pub states: Vec<State>,
    pub biases: Vec<Bias>,
    /// Wheel-scale factor per state; empty when the mode does not estimate it.
    pub wheel_scales: Vec<f64>,
    pub segments: Vec<ArcSegment>,
    /// Whitened Jacobian at the solution.
    pub jacobian: DMatrix<f64>,
    /// `JᵀJ`
    pub information: DMatrix<f64>,
    /// `(JᵀJ)⁻¹`, when the information matrix is invertible.
    pub covariance: Option<DMatrix<f64>>,
    pub final_cost: f64,
    /// One report per solver run, in order.
    pub reports: Vec<SolverReport>,
    /// One report per adaptive segment fit, in order.
    pub fit_reports: Vec<FitReport>,
    /// IMU intervals re-integrated while folding the final bias accumulators.
    pub final_reintegrated: Vec<usize>,
    pub skipped_lane_points: usize,
    pub frame: LocalFrame,
}

impl FusionSolution {
    /// Report of the last solver run.
    pub fn report(&self) -> Option<&SolverReport> {
        self.reports.last()
    }

    /// Intervals re-integrated by accepted solver steps, over every run in order.
    pub fn reintegrated_intervals(&self) -> Vec<usize> {
        self.reports
            .iter()
            .flat_map(|r| r.reintegrated.iter().copied())
            .collect()
    }

    /// Total re-integrations over all solver runs and finalization.
    pub fn reintegrations(&self) -> usize {
        self.reports.iter().map(|r| r.reintegrated.len()).sum::<usize>()
            + self.final_reintegrated.len()
    }

    /// Geodetic position of a state.
    pub fn geodetic_position(&self, index: usize) -> Option<GeodeticPoint> {
        self.states
            .get(index)
            .map(|state| self.frame.to_geodetic(&state.position))
    }
}

/// Runs the batch fusion selected by a [`FusionConfig`].
#[derive(Debug, Clone)]
pub struct Estimator {
    config: FusionConfig,
    lane_jacobian: Box<dyn LaneJacobian>,
}

impl Estimator {
    pub fn new(config: FusionConfig) -> Self {
        let lane_jacobian = Box::new(ForwardDifference {
            step: config.lane.jacobian_step,
        });
        Self {
            config,
            lane_jacobian,
        }
    }

    /// Replaces the lane Jacobian strategy.
    pub fn with_lane_jacobian(mut self, lane_jacobian: Box<dyn LaneJacobian>) -> Self {
        self.lane_jacobian = lane_jacobian;
        self
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn run(&self, inputs: &FusionInputs) -> FusionResult<FusionSolution> {
        validate_inputs(inputs)?;
        let mode = self.config.mode;
        let capabilities = Capabilities::for_mode(mode);
        let frame = LocalFrame::new(inputs.gnss_origin);

        // --- 1. Initial estimate ---
        let mut estimate = self.initialize(inputs, &capabilities)?;
        info!(
            states = estimate.states.len(),
            segments = estimate.segments.len(),
            ?mode,
            "initialized estimate"
        );

        // --- 2. Problem ---
        let prior = PriorValues::capture(&estimate.states[0], &estimate.biases[0]);
        let gnss = inputs
            .gnss
            .iter()
            .map(|fix| GnssTarget::from_fix(fix, &frame))
            .collect();
        let problem = Problem::new(
            self.config.clone(),
            prior,
            gnss,
            inputs.wheel.clone(),
            inputs.imu.clone(),
            self.lane_jacobian.clone(),
        );
        let solver = solver_for(&self.config.solver);
        let fitter = ArcFitter::new(self.config.lane.clone());
        let mut reports = Vec::new();
        let mut fit_reports = Vec::new();

        // --- 3. Solve ---
        let final_capabilities = match mode {
            FusionMode::Basic | FusionMode::Partial => {
                estimate = solve(solver.as_ref(), &problem, estimate, capabilities, &mut reports)?;
                capabilities
            }
            FusionMode::Full => {
                let Estimate {
                    states, segments, ..
                } = &mut estimate;
                for (s, segment) in segments.iter_mut().enumerate() {
                    let points = locate_points(s, &segment.points, states)?;
                    fit_reports.push(fitter.fit_adaptive(s, segment, &points));
                }
                estimate = solve(solver.as_ref(), &problem, estimate, capabilities, &mut reports)?;
                capabilities
            }
            FusionMode::TwoPhase => {
                estimate = solve(solver.as_ref(), &problem, estimate, capabilities, &mut reports)?;
                let fine = capabilities.refined();
                let rounds = self.config.lane.max_outer_iterations.max(1);
                for round in 0..rounds {
                    let changed = refine_segments(&fitter, &mut estimate, &mut fit_reports)?;
                    if round > 0 && !changed {
                        debug!(round, "every segment valid, refinement done");
                        break;
                    }
                    estimate = solve(solver.as_ref(), &problem, estimate, fine, &mut reports)?;
                }
                fine
            }
        };

        // --- 4. Finalize ---
        let num_states = estimate.states.len();
        let layout = Layout::new(num_states, final_capabilities, &estimate.segments);
        let (estimate, outcome) =
            problem.retract(&estimate, &DVector::zeros(layout.dim()), &layout, true)?;
        debug!(
            reintegrated = outcome.reintegrated.len(),
            "folded bias accumulators"
        );
        let Linearization {
            jacobian,
            residual,
            skipped_lane_points,
        } = problem.linearize(&estimate, &layout)?;

        let information = jacobian.tr_mul(&jacobian);
        let covariance = information.clone().cholesky().map(|c| c.inverse());
        if covariance.is_none() {
            warn!(dim = layout.dim(), "information matrix not invertible, no covariance");
        }
        if skipped_lane_points > 0 {
            warn!(skipped_lane_points, "lane points outside their arcs at the solution");
        }
        let final_cost = 0.5 * residual.norm_squared();
        info!(final_cost, solver_runs = reports.len(), "fusion run finished");

        let Estimate {
            states,
            biases,
            segments,
            ..
        } = estimate;
        let wheel_scales = states.iter().filter_map(|s| s.wheel_scale).collect();
        Ok(FusionSolution {
            states,
            biases,
            wheel_scales,
            segments,
            jacobian,
            information,
            covariance,
            final_cost,
            reports,
            fit_reports,
            final_reintegrated: outcome.reintegrated,
            skipped_lane_points,
            frame,
        })
    }

    /// Pre-integrates every interval with the initial bias and chains the
    /// increments from the initial pose.
    fn initialize(&self, inputs: &FusionInputs, capabilities: &Capabilities) -> FusionResult<Estimate> {
        let noise = ImuNoise::from(&self.config.noise);
        let gravity = gravity_vector(self.config.noise.gravity);
        let initial_bias = &inputs.initial_bias;
        let wheel_scale = capabilities.wheel_scale.then_some(1.0);

        // --- 1. Clusters ---
        let clusters = inputs
            .imu
            .iter()
            .enumerate()
            .map(|(i, interval)| {
                ImuCluster::integrate(
                    i,
                    inputs.state_times[i],
                    interval,
                    initial_bias.gyro,
                    initial_bias.accel,
                    &noise,
                )
            })
            .collect::<FusionResult<Vec<_>>>()?;

        // --- 2. States ---
        let pose = &inputs.initial_pose;
        let mut states = Vec::with_capacity(inputs.state_times.len());
        let (mut rotation, mut velocity, mut position) = (pose.rotation, pose.velocity, pose.position);
        for (i, &timestamp) in inputs.state_times.iter().enumerate() {
            if i > 0 {
                (rotation, velocity, position) =
                    clusters[i - 1].predict(&rotation, &velocity, &position, &gravity);
            }
            states.push(State {
                timestamp,
                rotation,
                velocity,
                position,
                wheel_scale,
                lanes: Default::default(),
            });
        }
        for measurement in &inputs.lanes {
            states[measurement.state_index].lanes.insert(measurement.clone());
        }

        // --- 3. Biases ---
        let biases = vec![Bias::new(initial_bias.gyro, initial_bias.accel); states.len()];

        // --- 4. Segments ---
        let mut segments = Vec::new();
        if capabilities.lane {
            for (s, seed) in inputs.segments.iter().enumerate() {
                let points = locate_points(s, &seed.points, &states)?;
                segments.push(ArcSegment::from_seed(
                    s,
                    seed,
                    &positions(&points),
                    self.config.lane.min_curvature,
                )?);
            }
        }

        Ok(Estimate {
            states,
            biases,
            clusters,
            segments,
        })
    }
}

fn solve(
    solver: &dyn Solver,
    problem: &Problem,
    estimate: Estimate,
    capabilities: Capabilities,
    reports: &mut Vec<SolverReport>,
) -> FusionResult<Estimate> {
    let layout = Layout::new(estimate.states.len(), capabilities, &estimate.segments);
    let solved = solver.solve(problem, estimate, &layout)?;
    reports.push(solved.report);
    Ok(solved.estimate)
}

/// Relocates every segment's points with the current states and refits the
/// segments that no longer validate. Returns whether any segment was refit.
fn refine_segments(
    fitter: &ArcFitter,
    estimate: &mut Estimate,
    fit_reports: &mut Vec<FitReport>,
) -> FusionResult<bool> {
    let Estimate {
        states, segments, ..
    } = estimate;
    let mut changed = false;
    for (s, segment) in segments.iter_mut().enumerate() {
        let points = locate_points(s, &segment.points, states)?;
        let validation = fitter.validate(segment, &points);
        if validation.is_valid() {
            continue;
        }
        debug!(
            segment = s,
            invalid_subsegments = validation.invalid_subsegments.len(),
            "segment no longer fits, refitting"
        );
        fit_reports.push(fitter.fit_adaptive(s, segment, &points));
        changed = true;
    }
    Ok(changed)
}

fn validate_inputs(inputs: &FusionInputs) -> FusionResult<()> {
    let n = inputs.state_times.len();
    if n < 2 {
        return Err(FusionError::InvalidInput(format!(
            "need at least two states, got {n}"
        )));
    }
    if inputs.state_times.windows(2).any(|w| w[1] <= w[0]) {
        return Err(FusionError::InvalidInput(
            "state timestamps must be strictly increasing".into(),
        ));
    }
    if inputs.imu.len() != n - 1 {
        return Err(FusionError::InvalidInput(format!(
            "{n} states need {} IMU intervals, got {}",
            n - 1,
            inputs.imu.len()
        )));
    }

    let check_index = |kind: &str, index: usize| {
        if index < n {
            Ok(())
        } else {
            Err(FusionError::InvalidInput(format!(
                "{kind} refers to state {index} of {n}"
            )))
        }
    };
    for fix in &inputs.gnss {
        check_index("GNSS fix", fix.state_index)?;
        if fix.horizontal_accuracy <= 0.0 || fix.vertical_accuracy <= 0.0 {
            return Err(FusionError::InvalidInput(format!(
                "GNSS fix at state {} has a non-positive accuracy",
                fix.state_index
            )));
        }
    }
    for sample in &inputs.wheel {
        check_index("wheel sample", sample.state_index)?;
    }
    for measurement in &inputs.lanes {
        check_index("lane measurement", measurement.state_index)?;
        if measurement.previews.iter().any(|p| p.lateral_std <= 0.0) {
            return Err(FusionError::InvalidInput(format!(
                "lane measurement at state {} has a non-positive lateral deviation",
                measurement.state_index
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{BiasEstimate, GnssFix, ImuInterval, ImuSample, InitialPose};
    use approx::assert_relative_eq;
    use nalgebra::{Rotation3, Vector3};

    /// Level, unaccelerated motion along east with one state per second.
    fn straight_inputs(states: usize, speed: f64) -> FusionInputs {
        let rate = 50.0;
        FusionInputs {
            state_times: (0..states).map(|i| i as f64).collect(),
            initial_pose: InitialPose {
                rotation: Rotation3::identity(),
                velocity: Vector3::new(speed, 0.0, 0.0),
                position: Vector3::zeros(),
            },
            initial_bias: BiasEstimate::default(),
            imu: (0..states - 1)
                .map(|i| ImuInterval {
                    end_time: (i + 1) as f64,
                    samples: (0..50)
                        .map(|k| ImuSample {
                            timestamp: i as f64 + k as f64 / rate,
                            accel: Vector3::new(0.0, 0.0, 9.81),
                            gyro: Vector3::zeros(),
                        })
                        .collect(),
                })
                .collect(),
            gnss_origin: GeodeticPoint::new(48.0, 11.0, 500.0),
            gnss: Vec::new(),
            wheel: Vec::new(),
            lanes: Vec::new(),
            segments: Vec::new(),
        }
    }

    #[test]
    fn initial_states_follow_the_imu() {
        let estimator = Estimator::new(FusionConfig::default());
        let inputs = straight_inputs(4, 10.0);
        let estimate = estimator
            .initialize(&inputs, &Capabilities::for_mode(FusionMode::Partial))
            .unwrap();
        assert_eq!(estimate.clusters.len(), 3);
        for (i, state) in estimate.states.iter().enumerate() {
            assert_relative_eq!(state.position, Vector3::new(10.0 * i as f64, 0.0, 0.0), epsilon = 1e-9);
            assert_eq!(state.wheel_scale, Some(1.0));
        }
    }

    #[test]
    fn mismatched_interval_count_is_rejected() {
        let mut inputs = straight_inputs(4, 10.0);
        inputs.imu.pop();
        let err = Estimator::new(FusionConfig::default()).run(&inputs).unwrap_err();
        assert!(matches!(err, FusionError::InvalidInput(_)));
    }

    #[test]
    fn out_of_range_fix_is_rejected() {
        let mut inputs = straight_inputs(3, 10.0);
        inputs.gnss.push(GnssFix {
            state_index: 7,
            timestamp: 7.0,
            position: inputs.gnss_origin,
            velocity_enu: Vector3::zeros(),
            heading: 0.0,
            horizontal_accuracy: 1.0,
            vertical_accuracy: 1.0,
        });
        let err = Estimator::new(FusionConfig::default()).run(&inputs).unwrap_err();
        assert!(matches!(err, FusionError::InvalidInput(_)));
    }

    #[test]
    fn consistent_basic_run_stays_put() {
        let mut inputs = straight_inputs(5, 10.0);
        let frame = LocalFrame::new(inputs.gnss_origin);
        inputs.gnss = (0..5)
            .map(|i| GnssFix {
                state_index: i,
                timestamp: i as f64,
                position: frame.to_geodetic(&Vector3::new(10.0 * i as f64, 0.0, 0.0)),
                velocity_enu: Vector3::new(10.0, 0.0, 0.0),
                heading: 0.0,
                horizontal_accuracy: 0.5,
                vertical_accuracy: 1.0,
            })
            .collect();
        let solution = Estimator::new(FusionConfig::default()).run(&inputs).unwrap();

        assert!(solution.final_cost < 1e-6);
        assert!(solution.covariance.is_some());
        assert!(solution.wheel_scales.is_empty());
        assert_eq!(solution.reports.len(), 1);
        for (i, state) in solution.states.iter().enumerate() {
            assert_relative_eq!(state.position, Vector3::new(10.0 * i as f64, 0.0, 0.0), epsilon = 1e-4);
        }
    }
}
