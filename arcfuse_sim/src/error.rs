// arcfuse_sim/src/error.rs

use arcfuse_core::error::FusionError;
use thiserror::Error;

/// Everything that can go wrong while building or running a scenario.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to load scenario configuration: {0}")]
    Config(#[from] figment::Error),

    #[error("failed to render scenario configuration: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid noise figure: {0}")]
    Noise(#[from] rand_distr::NormalError),

    #[error("invalid scenario: {0}")]
    Invalid(String),

    #[error(transparent)]
    Fusion(#[from] FusionError),
}
