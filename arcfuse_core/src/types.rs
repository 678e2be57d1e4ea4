// arcfuse_core/src/types.rs

use nalgebra::{Rotation3, Vector3};

use crate::messages::{LaneMeasurement, LanePreview, LaneSide};

// --- Core Estimation Values ---

/// The lane previews a state was created with, per side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaneWindow {
    pub left: Option<LaneMeasurement>,
    pub right: Option<LaneMeasurement>,
}

impl LaneWindow {
    pub fn side(&self, side: LaneSide) -> Option<&LaneMeasurement> {
        match side {
            LaneSide::Left => self.left.as_ref(),
            LaneSide::Right => self.right.as_ref(),
        }
    }

    pub fn preview(&self, side: LaneSide, index: usize) -> Option<&LanePreview> {
        self.side(side).and_then(|m| m.previews.get(index))
    }

    pub(crate) fn insert(&mut self, measurement: LaneMeasurement) {
        match measurement.side {
            LaneSide::Left => self.left = Some(measurement),
            LaneSide::Right => self.right = Some(measurement),
        }
    }
}

/// Kinematic state at one pose index.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub timestamp: f64,
    /// Body → world rotation.
    pub rotation: Rotation3<f64>,
    /// Velocity in the world frame.
    pub velocity: Vector3<f64>,
    /// Position in the world frame.
    pub position: Vector3<f64>,
    /// Wheel-speed scale factor; `None` when the mode does not estimate it.
    pub wheel_scale: Option<f64>,
    pub lanes: LaneWindow,
}

impl State {
    /// World-frame location of a body-frame offset.
    pub fn body_to_world(&self, offset: &Vector3<f64>) -> Vector3<f64> {
        self.position + self.rotation * offset
    }

    /// Body-frame coordinates of a world-frame point.
    pub fn world_to_body(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.inverse() * (point - self.position)
    }
}

/// Sensor bias at one pose index.
///
/// `gyro`/`accel` are the nominal values the IMU interval starting at this index
/// was pre-integrated with; the deltas hold the change not yet absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Bias {
    pub gyro: Vector3<f64>,
    pub accel: Vector3<f64>,
    pub delta_gyro: Vector3<f64>,
    pub delta_accel: Vector3<f64>,
}

impl Bias {
    pub fn new(gyro: Vector3<f64>, accel: Vector3<f64>) -> Self {
        Self {
            gyro,
            accel,
            ..Default::default()
        }
    }

    pub fn effective_gyro(&self) -> Vector3<f64> {
        self.gyro + self.delta_gyro
    }

    pub fn effective_accel(&self) -> Vector3<f64> {
        self.accel + self.delta_accel
    }
}
