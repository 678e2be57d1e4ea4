// arcfuse_sim/src/sensors/lane.rs

use arcfuse_core::factors::lane::lateral_on_arc;
use arcfuse_core::messages::{LaneMeasurement, LanePointRef, LanePreview, SegmentSeed};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::config::{BoundaryConfig, LaneSimConfig};
use crate::error::ScenarioError;
use crate::trajectory::{TrajectoryGenerator, TruthSample};

/// Generates preview points of boundaries running parallel to the trajectory
/// and the seed partition the estimator starts its arc fit from.
#[derive(Debug, Clone)]
pub struct LaneSynthesizer {
    config: LaneSimConfig,
    lateral_noise: Normal<f64>,
}

impl LaneSynthesizer {
    pub fn new(config: &LaneSimConfig) -> Result<Self, ScenarioError> {
        if config.lateral_std <= 0.0 {
            return Err(ScenarioError::Invalid(format!(
                "lane lateral_std must be positive, got {}",
                config.lateral_std
            )));
        }
        if config.previews.is_empty() {
            return Err(ScenarioError::Invalid("lane previews must not be empty".into()));
        }
        if config.seed_subsegments == 0 {
            return Err(ScenarioError::Invalid("seed_subsegments must be at least 1".into()));
        }
        Ok(Self {
            config: config.clone(),
            lateral_noise: Normal::new(0.0, config.lateral_std)?,
        })
    }

    pub fn boundaries(&self) -> &[BoundaryConfig] {
        &self.config.boundaries
    }

    /// True curvature of a boundary; zero on a straight drive.
    pub fn curvature(boundary: &BoundaryConfig, truth: &TrajectoryGenerator) -> f64 {
        match truth.turn_radius() {
            Some(radius) => 1.0 / (radius - boundary.offset),
            None => 0.0,
        }
    }

    /// One boundary as seen from a state.
    ///
    /// `None` when a look-ahead reaches past the boundary circle.
    pub fn measure<R: Rng>(
        &self,
        rng: &mut R,
        boundary: &BoundaryConfig,
        truth: &TrajectoryGenerator,
        sample: &TruthSample,
        state_index: usize,
    ) -> Option<LaneMeasurement> {
        let curvature = Self::curvature(boundary, truth);
        let previews = self
            .config
            .previews
            .iter()
            .map(|&longitudinal| {
                let lateral = match truth.turn_center() {
                    Some(center) => lateral_on_arc(
                        &sample.rotation,
                        &sample.position,
                        &center,
                        curvature,
                        longitudinal,
                    )?,
                    None => boundary.offset,
                };
                Some(LanePreview {
                    longitudinal,
                    lateral: lateral + self.lateral_noise.sample(rng),
                    vertical: 0.0,
                    lateral_std: self.config.lateral_std,
                    vertical_std: self.config.lateral_std,
                })
            })
            .collect::<Option<Vec<_>>>()?;

        Some(LaneMeasurement {
            state_index,
            side: boundary.side,
            previews,
            detection_probability: self.config.detection_probability,
            reliability: 1.0,
        })
    }

    /// Seed partition over the first preview of every measurement of a side.
    ///
    /// The points are split into `seed_subsegments` nearly equal runs, capped so
    /// every run keeps at least two points.
    pub fn seed(&self, boundary: &BoundaryConfig, measurements: &[LaneMeasurement]) -> Option<SegmentSeed> {
        let points: Vec<LanePointRef> = measurements
            .iter()
            .filter(|m| m.side == boundary.side)
            .map(|m| LanePointRef {
                state_index: m.state_index,
                side: m.side,
                preview_index: 0,
            })
            .collect();
        if points.len() < 2 {
            return None;
        }

        let runs = self.config.seed_subsegments.min(points.len() / 2).max(1);
        let bounds: Vec<(usize, usize)> = (0..runs)
            .map(|r| (r * points.len() / runs, (r + 1) * points.len() / runs - 1))
            .collect();

        Some(SegmentSeed {
            side: boundary.side,
            curvatures: vec![self.config.seed_curvature; runs],
            // Zero lengths are recomputed from the located points.
            lengths: vec![0.0; runs],
            points,
            bounds,
        })
    }
}
