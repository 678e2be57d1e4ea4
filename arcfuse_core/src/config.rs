// arcfuse_core/src/config.rs

//! Run configuration.
//!
//! Every struct here deserializes with per-field defaults, so a configuration
//! file only needs to name what it changes.

use serde::{Deserialize, Serialize};

// =========================================================================
// == Top-Level Configuration ==
// =========================================================================

/// Everything that parametrizes one fusion run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FusionConfig {
    pub mode: FusionMode,
    pub solver: SolverConfig,
    pub noise: NoiseConfig,
    pub prior: PriorConfig,
    pub repropagation: RepropagationThresholds,
    pub lane: LaneConfig,
}

/// Selects which factor blocks and variables take part in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMode {
    /// Prior, inertial motion and GNSS.
    #[default]
    Basic,
    /// Basic plus wheel speed with estimated wheel-scale factors.
    Partial,
    /// Partial plus the lane arc-spline model, one joint solve.
    Full,
    /// Full with a coarse phase followed by adaptive refinement.
    TwoPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    #[default]
    GaussNewton,
    LevenbergMarquardt,
    TrustRegion,
}

// =========================================================================
// == Solver ==
// =========================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverConfig {
    pub kind: SolverKind,
    pub max_iterations: usize,
    /// Stop once the cost drops below this value.
    pub cost_threshold: f64,
    /// Stop once the absolute cost change between iterations drops below this.
    pub cost_change_threshold: f64,
    /// Stop once the step norm drops below this.
    pub step_threshold: f64,

    // --- Gauss-Newton oscillation detection ---
    pub oscillation_window: usize,
    pub oscillation_relative_band: f64,
    pub oscillation_absolute_band: f64,

    // --- Levenberg-Marquardt ---
    pub initial_lambda: f64,
    pub lambda_min: f64,
    pub lambda_max: f64,
    pub lambda_increase: f64,
    pub lambda_decrease: f64,
    /// Minimum gain ratio for a trial step to be accepted (LM and TR).
    pub gain_threshold: f64,

    // --- Trust region (dogleg) ---
    pub initial_radius: f64,
    pub radius_floor: f64,
    pub radius_max: f64,
    pub shrink_threshold: f64,
    pub grow_threshold: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            kind: SolverKind::GaussNewton,
            max_iterations: 30,
            cost_threshold: 1e-6,
            cost_change_threshold: 1e-10,
            step_threshold: 1e-10,
            oscillation_window: 5,
            oscillation_relative_band: 1e-4,
            oscillation_absolute_band: 1e-9,
            initial_lambda: 1e-3,
            lambda_min: 1e-12,
            lambda_max: 1e10,
            lambda_increase: 10.0,
            lambda_decrease: 10.0,
            gain_threshold: 1e-3,
            initial_radius: 10.0,
            radius_floor: 1e-10,
            radius_max: 1e6,
            shrink_threshold: 0.25,
            grow_threshold: 0.75,
        }
    }
}

// =========================================================================
// == Sensor Noise ==
// =========================================================================

/// 1-sigma noise figures of every sensor model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NoiseConfig {
    /// Per-sample gyroscope noise (rad/s).
    pub gyro_noise_std: f64,
    /// Per-sample accelerometer noise (m/s²).
    pub accel_noise_std: f64,
    /// Position integration noise density (m/√s), keeps pre-integration full rank.
    pub integration_noise_std: f64,
    /// Gyro bias random walk (rad/s/√s).
    pub gyro_bias_walk_std: f64,
    /// Accel bias random walk (m/s²/√s).
    pub accel_bias_walk_std: f64,
    pub wheel_speed_std: f64,
    /// Nonholonomic lateral slip allowance (m/s).
    pub wheel_lateral_std: f64,
    /// Nonholonomic vertical motion allowance (m/s).
    pub wheel_vertical_std: f64,
    /// Scale-factor drift between consecutive states.
    pub wheel_scale_walk_std: f64,
    /// Rear-axle centre in the body frame (m).
    pub wheel_lever_arm: [f64; 3],
    /// Gravity magnitude (m/s²), acting along -z of the ENU world frame.
    pub gravity: f64,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            gyro_noise_std: 1e-3,
            accel_noise_std: 1e-2,
            integration_noise_std: 1e-4,
            gyro_bias_walk_std: 1e-4,
            accel_bias_walk_std: 1e-3,
            wheel_speed_std: 0.05,
            wheel_lateral_std: 0.1,
            wheel_vertical_std: 0.1,
            wheel_scale_walk_std: 1e-3,
            wheel_lever_arm: [0.0, 0.0, 0.0],
            gravity: 9.81,
        }
    }
}

/// 1-sigma tightness of the prior on the first state, bias and scale factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PriorConfig {
    pub rotation_std: f64,
    pub velocity_std: f64,
    pub position_std: f64,
    pub gyro_bias_std: f64,
    pub accel_bias_std: f64,
    pub wheel_scale_std: f64,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            rotation_std: 1e-3,
            velocity_std: 0.1,
            position_std: 0.01,
            gyro_bias_std: 1e-2,
            accel_bias_std: 1e-1,
            wheel_scale_std: 0.05,
        }
    }
}

/// Bias change magnitudes above which an IMU interval is re-integrated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepropagationThresholds {
    pub gyro: f64,
    pub accel: f64,
}

impl Default for RepropagationThresholds {
    fn default() -> Self {
        Self {
            gyro: 0.01,
            accel: 0.1,
        }
    }
}

// =========================================================================
// == Lane Model ==
// =========================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaneConfig {
    /// Forward-difference perturbation of the lane residual Jacobian.
    pub jacobian_step: f64,
    /// 1-sigma of the anchor pinning arc nodes to data points (m).
    pub anchor_std: f64,
    /// Lane measurements with a lower detection probability are not fused.
    pub min_detection_probability: f64,
    /// Curvature magnitudes are kept at or above this value (1/m).
    pub min_curvature: f64,
    /// Every n-th point enters the coarse base fit.
    pub base_fit_stride: usize,
    pub fit_max_iterations: usize,
    /// Per-point normalized squared error above which the point is invalid.
    pub chi2_threshold: f64,
    /// Invalid points at which a sub-segment is itself invalid.
    pub invalid_points_per_subsegment: usize,
    /// Replications allowed per segment per validation pass.
    pub max_replications: usize,
    /// A sub-segment needs at least this many points to be split.
    pub min_points_to_split: usize,
    /// Validate / replicate / re-solve rounds in the two-phase mode.
    pub max_outer_iterations: usize,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            jacobian_step: 1e-6,
            anchor_std: 0.05,
            min_detection_probability: 0.5,
            min_curvature: 1e-6,
            base_fit_stride: 3,
            fit_max_iterations: 50,
            chi2_threshold: CHI2_1DOF_999,
            invalid_points_per_subsegment: 3,
            max_replications: 10,
            min_points_to_split: 4,
            max_outer_iterations: 3,
        }
    }
}

/// 99.9 % quantile of the chi-square distribution with one degree of freedom.
pub const CHI2_1DOF_999: f64 = 10.827_566_170_662_733;
