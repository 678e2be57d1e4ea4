// arcfuse_sim/src/config.rs

//! Scenario files.
//!
//! A scenario TOML describes the synthetic drive and embeds the fusion
//! configuration under `[fusion]`. Every section falls back to its defaults,
//! so a file only needs to name what it changes.

use std::path::Path;

use arcfuse_core::config::FusionConfig;
use arcfuse_core::messages::LaneSide;
use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ScenarioError;

// =========================================================================
// == Top-Level Configuration ==
// =========================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioConfig {
    pub simulation: Simulation,
    pub trajectory: TrajectoryConfig,
    pub imu: ImuSimConfig,
    pub gnss: GnssSimConfig,
    pub wheel: WheelSimConfig,
    pub lane: LaneSimConfig,
    pub initial_error: InitialError,
    pub fusion: FusionConfig,
}

// =========================================================================
// == Configuration Sub-Structs ==
// =========================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Simulation {
    /// Seed of the pseudo-random number generator.
    pub seed: u64,
    pub duration_seconds: f64,
    /// States per second.
    pub state_rate: f64,
    /// IMU samples per second.
    pub imu_rate: f64,
    /// Local frame origin `[lat°, lon°, alt m]`.
    pub origin: [f64; 3],
}

impl Default for Simulation {
    fn default() -> Self {
        Self {
            seed: 42,
            duration_seconds: 10.0,
            state_rate: 1.0,
            imu_rate: 100.0,
            origin: [48.137, 11.575, 520.0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryShape {
    #[default]
    Straight,
    ConstantTurn,
}

/// Planar constant-speed motion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrajectoryConfig {
    pub shape: TrajectoryShape,
    /// Ground speed (m/s).
    pub speed: f64,
    /// Yaw rate of a constant turn (rad/s, positive turns left).
    pub yaw_rate: f64,
    /// Heading at t = 0 (rad, from east, counter-clockwise).
    pub initial_heading: f64,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            shape: TrajectoryShape::Straight,
            speed: 10.0,
            yaw_rate: 0.0,
            initial_heading: 0.0,
        }
    }
}

/// A constant gyro bias added to the samples of one interval only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BiasStep {
    pub interval: usize,
    pub gyro: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImuSimConfig {
    pub gyro_noise_std: f64,
    pub accel_noise_std: f64,
    pub gyro_bias: [f64; 3],
    pub accel_bias: [f64; 3],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bias_step: Option<BiasStep>,
}

impl Default for ImuSimConfig {
    fn default() -> Self {
        Self {
            gyro_noise_std: 0.0,
            accel_noise_std: 0.0,
            gyro_bias: [0.0; 3],
            accel_bias: [0.0; 3],
            bias_step: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GnssSimConfig {
    pub enabled: bool,
    /// A fix on every n-th state.
    pub every_n_states: usize,
    /// Accuracy reported with each fix (m).
    pub horizontal_accuracy: f64,
    pub vertical_accuracy: f64,
    /// Perturb fixes with their reported accuracy; otherwise fixes are exact.
    pub apply_noise: bool,
}

impl Default for GnssSimConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            every_n_states: 1,
            horizontal_accuracy: 0.5,
            vertical_accuracy: 1.0,
            apply_noise: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WheelSimConfig {
    pub enabled: bool,
    /// True scale factor: measured speed × scale = true speed.
    pub scale: f64,
    pub speed_noise_std: f64,
}

impl Default for WheelSimConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scale: 1.0,
            speed_noise_std: 0.0,
        }
    }
}

/// One lane boundary running parallel to the trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoundaryConfig {
    pub side: LaneSide,
    /// Lateral offset from the trajectory (m, positive to the left).
    pub offset: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaneSimConfig {
    /// Look-ahead distances of the previews of every state (m); the first one
    /// becomes the segment data point.
    pub previews: Vec<f64>,
    pub lateral_std: f64,
    pub detection_probability: f64,
    /// Sub-segments of the initial partition.
    pub seed_subsegments: usize,
    /// Curvature every seed sub-segment starts from (1/m).
    pub seed_curvature: f64,
    pub boundaries: Vec<BoundaryConfig>,
}

impl Default for LaneSimConfig {
    fn default() -> Self {
        Self {
            previews: vec![5.0],
            lateral_std: 0.05,
            detection_probability: 0.9,
            seed_subsegments: 1,
            seed_curvature: 1e-3,
            boundaries: Vec::new(),
        }
    }
}

/// Offsets of the initial pose handed to the estimator from the true one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InitialError {
    pub position: [f64; 3],
    pub velocity: [f64; 3],
    pub yaw: f64,
}

// =========================================================================
// == Loading ==
// =========================================================================

/// Loads a scenario file over the defaults.
pub fn load_scenario(path: impl AsRef<Path>) -> Result<ScenarioConfig, ScenarioError> {
    let path = existing(path.as_ref())?;
    Ok(Figment::from(Serialized::defaults(ScenarioConfig::default()))
        .merge(Toml::file(path))
        .extract()?)
}

/// Parses a scenario from TOML text over the defaults.
pub fn parse_scenario(text: &str) -> Result<ScenarioConfig, ScenarioError> {
    Ok(Figment::from(Serialized::defaults(ScenarioConfig::default()))
        .merge(Toml::string(text))
        .extract()?)
}

/// Loads a bare fusion configuration file over the defaults.
pub fn load_fusion_config(path: impl AsRef<Path>) -> Result<FusionConfig, ScenarioError> {
    let path = existing(path.as_ref())?;
    Ok(Figment::from(Serialized::defaults(FusionConfig::default()))
        .merge(Toml::file(path))
        .extract()?)
}

// A missing file would otherwise silently yield the defaults.
fn existing(path: &Path) -> Result<&Path, ScenarioError> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(ScenarioError::Invalid(format!(
            "configuration file not found: {}",
            path.display()
        )))
    }
}

/// Renders a scenario back to TOML.
pub fn render_scenario(config: &ScenarioConfig) -> Result<String, ScenarioError> {
    Ok(toml::to_string_pretty(config)?)
}
