// arcfuse_sim/src/trajectory.rs

//! Ground-truth kinematics of a planar constant-speed drive.

use nalgebra::{Rotation3, Vector2, Vector3};

use crate::config::{TrajectoryConfig, TrajectoryShape};

/// Yaw rates below this are driven as a straight line.
const STRAIGHT_YAW_RATE: f64 = 1e-9;

/// The true vehicle state at one instant, in the ENU world frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TruthSample {
    pub time: f64,
    /// Body → world.
    pub rotation: Rotation3<f64>,
    pub velocity: Vector3<f64>,
    pub position: Vector3<f64>,
    /// Coordinate acceleration in the world frame.
    pub acceleration: Vector3<f64>,
    /// Angular rate in the body frame.
    pub angular_rate: Vector3<f64>,
}

impl TruthSample {
    /// What a perfect accelerometer reads: `Rᵀ(a − g)`.
    pub fn specific_force(&self, gravity: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.inverse() * (self.acceleration - gravity)
    }
}

#[derive(Debug, Clone)]
pub struct TrajectoryGenerator {
    speed: f64,
    yaw_rate: f64,
    initial_heading: f64,
}

impl TrajectoryGenerator {
    pub fn new(config: &TrajectoryConfig) -> Self {
        let yaw_rate = match config.shape {
            TrajectoryShape::Straight => 0.0,
            TrajectoryShape::ConstantTurn => config.yaw_rate,
        };
        Self {
            speed: config.speed,
            yaw_rate,
            initial_heading: config.initial_heading,
        }
    }

    pub fn is_straight(&self) -> bool {
        self.yaw_rate.abs() < STRAIGHT_YAW_RATE
    }

    /// Signed turn radius; positive for left turns.
    pub fn turn_radius(&self) -> Option<f64> {
        (!self.is_straight()).then(|| self.speed / self.yaw_rate)
    }

    /// Centre of the turn in the horizontal plane.
    pub fn turn_center(&self) -> Option<Vector2<f64>> {
        let radius = self.turn_radius()?;
        let (sin, cos) = self.initial_heading.sin_cos();
        Some(Vector2::new(-sin * radius, cos * radius))
    }

    pub fn sample(&self, time: f64) -> TruthSample {
        let heading = self.initial_heading + self.yaw_rate * time;
        let (sin, cos) = heading.sin_cos();
        let (sin0, cos0) = self.initial_heading.sin_cos();

        let position = match self.turn_radius() {
            None => Vector3::new(cos0, sin0, 0.0) * (self.speed * time),
            Some(radius) => Vector3::new(radius * (sin - sin0), radius * (cos0 - cos), 0.0),
        };

        TruthSample {
            time,
            rotation: Rotation3::from_axis_angle(&Vector3::z_axis(), heading),
            velocity: Vector3::new(cos, sin, 0.0) * self.speed,
            position,
            acceleration: Vector3::new(-sin, cos, 0.0) * (self.speed * self.yaw_rate),
            angular_rate: Vector3::new(0.0, 0.0, self.yaw_rate),
        }
    }
}
