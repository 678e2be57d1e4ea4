// arcfuse_core/src/messages.rs

use nalgebra::{Rotation3, Vector3};
use serde::{Deserialize, Serialize};

use crate::frames::GeodeticPoint;

// =========================================================================
// == Inertial Data ==
// =========================================================================

/// One raw IMU sample in the body frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    pub timestamp: f64,
    /// Specific force (m/s²).
    pub accel: Vector3<f64>,
    /// Angular rate (rad/s).
    pub gyro: Vector3<f64>,
}

/// All IMU samples between two consecutive states.
///
/// The first sample is taken at (or just after) the start state's timestamp and
/// each sample is held until the next one; the last until `end_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuInterval {
    pub end_time: f64,
    pub samples: Vec<ImuSample>,
}

// =========================================================================
// == Absolute and Odometric Aiding ==
// =========================================================================

/// A GNSS fix coincident with a state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GnssFix {
    pub state_index: usize,
    pub timestamp: f64,
    pub position: GeodeticPoint,
    /// Velocity in the local ENU frame. Carried through but not fused.
    pub velocity_enu: Vector3<f64>,
    /// Course over ground (rad, from east, counter-clockwise).
    pub heading: f64,
    /// 1-sigma horizontal accuracy (m).
    pub horizontal_accuracy: f64,
    /// 1-sigma vertical accuracy (m).
    pub vertical_accuracy: f64,
}

/// A wheel-speed reading mapped to a state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WheelSpeedSample {
    pub state_index: usize,
    pub timestamp: f64,
    /// Measured forward speed (m/s), before scale-factor correction.
    pub speed: f64,
    /// Raw gyroscope reading at the sample time (rad/s).
    pub angular_rate: Vector3<f64>,
}

// =========================================================================
// == Lane Detections ==
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LaneSide {
    Left,
    Right,
}

/// One lane-boundary preview point in the body frame of its state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LanePreview {
    /// Fixed look-ahead distance along the body x axis (m).
    pub longitudinal: f64,
    /// Measured lateral offset along the body y axis (m).
    pub lateral: f64,
    /// Measured vertical offset along the body z axis (m).
    pub vertical: f64,
    pub lateral_std: f64,
    pub vertical_std: f64,
}

impl LanePreview {
    pub fn offset(&self) -> Vector3<f64> {
        Vector3::new(self.longitudinal, self.lateral, self.vertical)
    }
}

/// The lane detector output for one side at one state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneMeasurement {
    pub state_index: usize,
    pub side: LaneSide,
    pub previews: Vec<LanePreview>,
    pub detection_probability: f64,
    pub reliability: f64,
}

/// Identifies one preview point of one state; the data points of an arc
/// segment are lists of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LanePointRef {
    pub state_index: usize,
    pub side: LaneSide,
    pub preview_index: usize,
}

/// The initial partition of one lane boundary into arc sub-segments.
///
/// Produced by the upstream lane classification; `bounds` are inclusive point
/// index ranges into `points`, one per sub-segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSeed {
    pub side: LaneSide,
    pub points: Vec<LanePointRef>,
    pub bounds: Vec<(usize, usize)>,
    pub curvatures: Vec<f64>,
    pub lengths: Vec<f64>,
}

// =========================================================================
// == Run Inputs ==
// =========================================================================

/// Pose the forward propagation starts from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InitialPose {
    pub rotation: Rotation3<f64>,
    pub velocity: Vector3<f64>,
    pub position: Vector3<f64>,
}

/// Initial sensor bias estimate.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BiasEstimate {
    pub gyro: Vector3<f64>,
    pub accel: Vector3<f64>,
}

/// Everything the estimator consumes from the external collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionInputs {
    /// Timestamp of every state; `imu` holds one interval per consecutive pair.
    pub state_times: Vec<f64>,
    pub initial_pose: InitialPose,
    pub initial_bias: BiasEstimate,
    pub imu: Vec<ImuInterval>,
    pub gnss_origin: GeodeticPoint,
    pub gnss: Vec<GnssFix>,
    pub wheel: Vec<WheelSpeedSample>,
    pub lanes: Vec<LaneMeasurement>,
    pub segments: Vec<SegmentSeed>,
}
