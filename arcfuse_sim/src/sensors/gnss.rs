// arcfuse_sim/src/sensors/gnss.rs

use arcfuse_core::frames::LocalFrame;
use arcfuse_core::manifold::heading;
use arcfuse_core::messages::GnssFix;
use nalgebra::Vector3;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::config::GnssSimConfig;
use crate::error::ScenarioError;
use crate::trajectory::TruthSample;

/// Generates geodetic fixes of the true antenna position.
#[derive(Debug, Clone)]
pub struct GnssSynthesizer {
    horizontal_accuracy: f64,
    vertical_accuracy: f64,
    /// `None` for exact fixes.
    noise: Option<(Normal<f64>, Normal<f64>)>,
}

impl GnssSynthesizer {
    pub fn new(config: &GnssSimConfig) -> Result<Self, ScenarioError> {
        if config.horizontal_accuracy <= 0.0 || config.vertical_accuracy <= 0.0 {
            return Err(ScenarioError::Invalid(
                "GNSS accuracies must be positive".into(),
            ));
        }
        let noise = if config.apply_noise {
            Some((
                Normal::new(0.0, config.horizontal_accuracy)?,
                Normal::new(0.0, config.vertical_accuracy)?,
            ))
        } else {
            None
        };
        Ok(Self {
            horizontal_accuracy: config.horizontal_accuracy,
            vertical_accuracy: config.vertical_accuracy,
            noise,
        })
    }

    pub fn fix<R: Rng>(
        &self,
        rng: &mut R,
        truth: &TruthSample,
        state_index: usize,
        frame: &LocalFrame,
    ) -> GnssFix {
        let error = match &self.noise {
            Some((horizontal, vertical)) => Vector3::new(
                horizontal.sample(rng),
                horizontal.sample(rng),
                vertical.sample(rng),
            ),
            None => Vector3::zeros(),
        };
        GnssFix {
            state_index,
            timestamp: truth.time,
            position: frame.to_geodetic(&(truth.position + error)),
            velocity_enu: truth.velocity,
            heading: heading(&truth.rotation),
            horizontal_accuracy: self.horizontal_accuracy,
            vertical_accuracy: self.vertical_accuracy,
        }
    }
}
