// arcfuse_sim/src/prelude.rs

// Re-export the entire arcfuse_core prelude so scenario code can reach the
// estimator and message types directly.
pub use arcfuse_core::prelude::*;

pub use crate::config::{
    load_fusion_config, load_scenario, parse_scenario, render_scenario, BoundaryConfig,
    InitialError, ScenarioConfig, TrajectoryConfig, TrajectoryShape,
};
pub use crate::error::ScenarioError;
pub use crate::scenario::{GroundTruth, Scenario};
pub use crate::trajectory::{TrajectoryGenerator, TruthSample};
