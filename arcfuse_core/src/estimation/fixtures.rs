// arcfuse_core/src/estimation/fixtures.rs

//! A short drive shared by the solver tests.

use nalgebra::{Rotation3, Vector3};

use super::problem::Problem;
use crate::config::{FusionConfig, FusionMode, SolverConfig};
use crate::factors::gnss::GnssTarget;
use crate::factors::inertial::gravity_vector;
use crate::factors::prior::PriorValues;
use crate::factors::ForwardDifference;
use crate::imu::{ImuCluster, ImuNoise};
use crate::lane::{ArcPose, ArcSegment, SubSegment};
use crate::layout::{Capabilities, Layout};
use crate::messages::{
    ImuInterval, ImuSample, LaneMeasurement, LanePointRef, LanePreview, LaneSide,
};
use crate::retraction::Estimate;
use crate::types::{Bias, LaneWindow, State};

pub(crate) const NUM_STATES: usize = 4;
const SPEED: f64 = 10.0;
const IMU_RATE: f64 = 50.0;
const LANE_OFFSET: f64 = 1.8;
const LOOK_AHEAD: f64 = 5.0;

/// Four states one second apart driving east at 10 m/s, a lane boundary 1.8 m
/// to the left and a GNSS fix on every true position.
///
/// The estimate starts 0.5 m north of the fixes; in the lane modes its one
/// segment starts 0.3 m off the boundary.
pub(crate) fn drive(mode: FusionMode, solver: SolverConfig) -> (Problem, Estimate, Layout) {
    let config = FusionConfig {
        mode,
        solver,
        ..FusionConfig::default()
    };
    let noise = ImuNoise::from(&config.noise);
    let gravity = gravity_vector(config.noise.gravity);
    let capabilities = Capabilities::for_mode(mode);

    let imu: Vec<ImuInterval> = (0..NUM_STATES - 1)
        .map(|i| ImuInterval {
            end_time: (i + 1) as f64,
            samples: (0..IMU_RATE as usize)
                .map(|k| ImuSample {
                    timestamp: i as f64 + k as f64 / IMU_RATE,
                    accel: -gravity,
                    gyro: Vector3::zeros(),
                })
                .collect(),
        })
        .collect();
    let clusters = imu
        .iter()
        .enumerate()
        .map(|(i, interval)| {
            ImuCluster::integrate(i, i as f64, interval, Vector3::zeros(), Vector3::zeros(), &noise)
                .unwrap()
        })
        .collect();

    let states: Vec<State> = (0..NUM_STATES)
        .map(|i| {
            let mut lanes = LaneWindow::default();
            lanes.insert(LaneMeasurement {
                state_index: i,
                side: LaneSide::Left,
                previews: vec![LanePreview {
                    longitudinal: LOOK_AHEAD,
                    lateral: LANE_OFFSET,
                    vertical: 0.0,
                    lateral_std: 0.1,
                    vertical_std: 0.1,
                }],
                detection_probability: 1.0,
                reliability: 1.0,
            });
            State {
                timestamp: i as f64,
                rotation: Rotation3::identity(),
                velocity: Vector3::new(SPEED, 0.0, 0.0),
                position: Vector3::new(SPEED * i as f64, 0.5, 0.0),
                wheel_scale: capabilities.wheel_scale.then_some(1.0),
                lanes,
            }
        })
        .collect();
    let biases = vec![Bias::default(); NUM_STATES];

    let mut segments = Vec::new();
    if capabilities.lane {
        segments.push(ArcSegment {
            side: LaneSide::Left,
            anchor: ArcPose::new(LOOK_AHEAD, LANE_OFFSET + 0.2, 0.0),
            subsegments: vec![SubSegment {
                curvature: 1e-4,
                sqrt_length: (SPEED * (NUM_STATES - 1) as f64).sqrt(),
                bounds: (0, NUM_STATES - 1),
                invalid_points: 0,
            }],
            points: (0..NUM_STATES)
                .map(|k| LanePointRef {
                    state_index: k,
                    side: LaneSide::Left,
                    preview_index: 0,
                })
                .collect(),
        });
    }

    let gnss = (0..NUM_STATES)
        .map(|i| GnssTarget {
            state_index: i,
            position: Vector3::new(SPEED * i as f64, 0.0, 0.0),
            horizontal_accuracy: 0.5,
            vertical_accuracy: 1.0,
        })
        .collect();
    let layout = Layout::new(NUM_STATES, capabilities, &segments);
    let problem = Problem::new(
        config.clone(),
        PriorValues::capture(&states[0], &biases[0]),
        gnss,
        Vec::new(),
        imu,
        Box::new(ForwardDifference {
            step: config.lane.jacobian_step,
        }),
    );
    let estimate = Estimate {
        states,
        biases,
        clusters,
        segments,
    };
    (problem, estimate, layout)
}
