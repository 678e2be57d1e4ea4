// arcfuse_sim/src/scenario.rs

//! Turns a scenario configuration into estimator inputs and the ground truth
//! they were generated from.

use std::path::Path;

use arcfuse_core::estimation::{Estimator, FusionSolution};
use arcfuse_core::factors::inertial::gravity_vector;
use arcfuse_core::frames::{GeodeticPoint, LocalFrame};
use arcfuse_core::messages::{BiasEstimate, FusionInputs, InitialPose, LaneSide};
use nalgebra::{Rotation3, Vector3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::config::{load_scenario, ScenarioConfig};
use crate::error::ScenarioError;
use crate::sensors::{GnssSynthesizer, ImuSynthesizer, LaneSynthesizer, WheelSynthesizer};
use crate::trajectory::{TrajectoryGenerator, TruthSample};

/// What the estimator should recover.
#[derive(Debug, Clone)]
pub struct GroundTruth {
    /// True state at every state timestamp.
    pub samples: Vec<TruthSample>,
    /// True gyro bias of every IMU interval.
    pub gyro_bias: Vec<Vector3<f64>>,
    pub accel_bias: Vector3<f64>,
    pub wheel_scale: f64,
    /// True curvature of every generated segment, in segment order.
    pub curvatures: Vec<(LaneSide, f64)>,
}

impl GroundTruth {
    /// Horizontal RMS error of a solution's positions.
    pub fn horizontal_rms(&self, solution: &FusionSolution) -> f64 {
        let sum: f64 = self
            .samples
            .iter()
            .zip(&solution.states)
            .map(|(truth, state)| (truth.position.xy() - state.position.xy()).norm_squared())
            .sum();
        (sum / self.samples.len().max(1) as f64).sqrt()
    }
}

#[derive(Debug, Clone)]
pub struct Scenario {
    config: ScenarioConfig,
}

impl Scenario {
    pub fn new(config: ScenarioConfig) -> Self {
        Self { config }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        Ok(Self::new(load_scenario(path)?))
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    /// Generates the estimator inputs and the truth behind them.
    pub fn build(&self) -> Result<(FusionInputs, GroundTruth), ScenarioError> {
        let sim = &self.config.simulation;
        if sim.state_rate <= 0.0 || sim.duration_seconds <= 0.0 {
            return Err(ScenarioError::Invalid(
                "duration_seconds and state_rate must be positive".into(),
            ));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(sim.seed);
        let gravity = gravity_vector(self.config.fusion.noise.gravity);
        let origin = GeodeticPoint::new(sim.origin[0], sim.origin[1], sim.origin[2]);
        let frame = LocalFrame::new(origin);

        // --- 1. Ground truth ---
        let truth = TrajectoryGenerator::new(&self.config.trajectory);
        let count = (sim.duration_seconds * sim.state_rate).floor() as usize + 1;
        if count < 2 {
            return Err(ScenarioError::Invalid(format!(
                "scenario yields {count} state(s), need at least two"
            )));
        }
        let state_times: Vec<f64> = (0..count).map(|i| i as f64 / sim.state_rate).collect();
        let samples: Vec<TruthSample> = state_times.iter().map(|&t| truth.sample(t)).collect();

        // --- 2. IMU ---
        let imu = ImuSynthesizer::new(&self.config.imu, sim.imu_rate, gravity)?;
        let intervals: Vec<_> = state_times
            .windows(2)
            .enumerate()
            .map(|(k, w)| imu.interval(&mut rng, &truth, k, w[0], w[1]))
            .collect();

        // --- 3. GNSS ---
        let mut gnss = Vec::new();
        if self.config.gnss.enabled {
            let synthesizer = GnssSynthesizer::new(&self.config.gnss)?;
            let every = self.config.gnss.every_n_states.max(1);
            for (i, sample) in samples.iter().enumerate().step_by(every) {
                gnss.push(synthesizer.fix(&mut rng, sample, i, &frame));
            }
        }

        // --- 4. Wheel speed ---
        let mut wheel = Vec::new();
        if self.config.wheel.enabled {
            let synthesizer =
                WheelSynthesizer::new(&self.config.wheel, self.config.fusion.noise.wheel_lever_arm)?;
            for (i, sample) in samples.iter().enumerate() {
                let raw_gyro = sample.angular_rate + imu.gyro_bias(i.min(count - 2));
                wheel.push(synthesizer.sample(&mut rng, sample, i, raw_gyro));
            }
        }

        // --- 5. Lane boundaries ---
        let mut lanes = Vec::new();
        let mut segments = Vec::new();
        let mut curvatures = Vec::new();
        if !self.config.lane.boundaries.is_empty() {
            let synthesizer = LaneSynthesizer::new(&self.config.lane)?;
            for boundary in synthesizer.boundaries() {
                let measured: Vec<_> = samples
                    .iter()
                    .enumerate()
                    .filter_map(|(i, sample)| synthesizer.measure(&mut rng, boundary, &truth, sample, i))
                    .collect();
                debug!(side = ?boundary.side, measurements = measured.len(), "synthesized lane boundary");
                if let Some(seed) = synthesizer.seed(boundary, &measured) {
                    segments.push(seed);
                    curvatures.push((boundary.side, LaneSynthesizer::curvature(boundary, &truth)));
                }
                lanes.extend(measured);
            }
        }

        // --- 6. Initial guess ---
        let error = &self.config.initial_error;
        let start = &samples[0];
        let initial_pose = InitialPose {
            rotation: Rotation3::from_axis_angle(&Vector3::z_axis(), error.yaw) * start.rotation,
            velocity: start.velocity + Vector3::from(error.velocity),
            position: start.position + Vector3::from(error.position),
        };

        info!(
            states = count,
            imu_intervals = intervals.len(),
            gnss = gnss.len(),
            wheel = wheel.len(),
            lanes = lanes.len(),
            segments = segments.len(),
            "built scenario"
        );

        let inputs = FusionInputs {
            state_times,
            initial_pose,
            initial_bias: BiasEstimate::default(),
            imu: intervals,
            gnss_origin: origin,
            gnss,
            wheel,
            lanes,
            segments,
        };
        let ground_truth = GroundTruth {
            samples,
            gyro_bias: (0..count - 1).map(|k| imu.gyro_bias(k)).collect(),
            accel_bias: imu.accel_bias(),
            wheel_scale: self.config.wheel.scale,
            curvatures,
        };
        Ok((inputs, ground_truth))
    }

    /// Builds the scenario and runs the estimator it configures.
    pub fn run(&self) -> Result<(FusionSolution, GroundTruth), ScenarioError> {
        let (inputs, truth) = self.build()?;
        let solution = Estimator::new(self.config.fusion.clone()).run(&inputs)?;
        Ok((solution, truth))
    }
}
