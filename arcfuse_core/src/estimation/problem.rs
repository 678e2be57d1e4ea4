// arcfuse_core/src/estimation/problem.rs

use nalgebra::{DMatrix, DVector, Vector3};

use crate::config::FusionConfig;
use crate::error::{FusionError, FusionResult};
use crate::factors::anchor::anchor_blocks;
use crate::factors::gnss::{gnss_block, GnssTarget};
use crate::factors::inertial::{bias_walk_block, gravity_vector, inertial_block};
use crate::factors::lane::lane_blocks;
use crate::factors::prior::{prior_block, PriorValues};
use crate::factors::wheel::{wheel_block, wheel_scale_walk_block};
use crate::factors::{FactorBlock, LaneJacobian};
use crate::imu::ImuNoise;
use crate::layout::Layout;
use crate::messages::{ImuInterval, WheelSpeedSample};
use crate::retraction::{Estimate, RetractionContext, RetractionOutcome};
use crate::types::{Bias, State};

/// The stacked, whitened system at one estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct Linearization {
    pub jacobian: DMatrix<f64>,
    pub residual: DVector<f64>,
    /// Lane points left out by the arc domain guard.
    pub skipped_lane_points: usize,
}

impl Linearization {
    /// `½‖r‖²`
    pub fn cost(&self) -> f64 {
        0.5 * self.residual.norm_squared()
    }

    /// `JᵀJ`
    pub fn information(&self) -> DMatrix<f64> {
        self.jacobian.tr_mul(&self.jacobian)
    }

    /// `Jᵀr`
    pub fn gradient(&self) -> DVector<f64> {
        self.jacobian.tr_mul(&self.residual)
    }

    /// Cost decrease the linear model predicts for step `h`.
    pub fn predicted_reduction(&self, step: &DVector<f64>) -> f64 {
        let jh = &self.jacobian * step;
        -(self.residual.dot(&jh) + 0.5 * jh.norm_squared())
    }
}

/// The measurements and models of one run, independent of the estimate.
#[derive(Debug, Clone)]
pub struct Problem {
    config: FusionConfig,
    noise: ImuNoise,
    gravity: Vector3<f64>,
    prior: PriorValues,
    gnss: Vec<GnssTarget>,
    wheel: Vec<WheelSpeedSample>,
    imu: Vec<ImuInterval>,
    lane_jacobian: Box<dyn LaneJacobian>,
}

impl Problem {
    pub fn new(
        config: FusionConfig,
        prior: PriorValues,
        gnss: Vec<GnssTarget>,
        wheel: Vec<WheelSpeedSample>,
        imu: Vec<ImuInterval>,
        lane_jacobian: Box<dyn LaneJacobian>,
    ) -> Self {
        Self {
            noise: ImuNoise::from(&config.noise),
            gravity: gravity_vector(config.noise.gravity),
            config,
            prior,
            gnss,
            wheel,
            imu,
            lane_jacobian,
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn gravity(&self) -> &Vector3<f64> {
        &self.gravity
    }

    /// Every factor the layout's capabilities switch on, plus the number of
    /// lane points the domain guard dropped.
    pub fn factors(&self, estimate: &Estimate, layout: &Layout) -> FusionResult<(Vec<FactorBlock>, usize)> {
        let caps = layout.capabilities();
        let states = &estimate.states;
        let biases = &estimate.biases;
        let mut factors = Vec::new();
        let mut skipped = 0;

        // --- 1. Prior ---
        if caps.prior {
            factors.push(prior_block(
                &self.prior,
                state_at(states, 0)?,
                bias_at(biases, 0)?,
                &self.config.prior,
                layout,
            ));
        }

        // --- 2. Inertial motion and bias walk ---
        if caps.inertial {
            for (i, cluster) in estimate.clusters.iter().enumerate() {
                let from = bias_at(biases, i)?;
                factors.push(inertial_block(
                    i,
                    cluster,
                    state_at(states, i)?,
                    state_at(states, i + 1)?,
                    from,
                    &self.gravity,
                    layout,
                )?);
                factors.push(bias_walk_block(
                    i,
                    cluster.dt,
                    from,
                    bias_at(biases, i + 1)?,
                    &self.config.noise,
                    layout,
                ));
            }
        }

        // --- 3. GNSS ---
        if caps.gnss {
            for target in &self.gnss {
                factors.push(gnss_block(target, state_at(states, target.state_index)?, layout));
            }
        }

        // --- 4. Wheel speed and scale continuity ---
        if caps.wheel {
            for sample in &self.wheel {
                let i = sample.state_index;
                factors.push(wheel_block(
                    sample,
                    state_at(states, i)?,
                    bias_at(biases, i)?,
                    &self.config.noise,
                    layout,
                ));
            }
            for (i, pair) in states.windows(2).enumerate() {
                if let (Some(from), Some(to)) = (pair[0].wheel_scale, pair[1].wheel_scale) {
                    factors.extend(wheel_scale_walk_block(i, from, to, &self.config.noise, layout));
                }
            }
        }

        // --- 5. Lane model ---
        if caps.lane {
            let strategy = self.lane_jacobian.as_ref();
            for (s, segment) in estimate.segments.iter().enumerate() {
                let (blocks, dropped) =
                    lane_blocks(s, segment, states, &self.config.lane, strategy, layout)?;
                factors.extend(blocks);
                skipped += dropped;
                factors.extend(anchor_blocks(
                    s,
                    segment,
                    states,
                    caps.anchors,
                    &self.config.lane,
                    strategy,
                    layout,
                )?);
            }
        }

        Ok((factors, skipped))
    }

    /// Stacks every factor into one dense system.
    pub fn linearize(&self, estimate: &Estimate, layout: &Layout) -> FusionResult<Linearization> {
        let (factors, skipped_lane_points) = self.factors(estimate, layout)?;
        let (jacobian, residual) = assemble(&factors, layout.dim());
        Ok(Linearization {
            jacobian,
            residual,
            skipped_lane_points,
        })
    }

    /// Moves `estimate` by `step`, re-integrating IMU intervals as needed.
    pub fn retract(
        &self,
        estimate: &Estimate,
        step: &DVector<f64>,
        layout: &Layout,
        finalize: bool,
    ) -> FusionResult<(Estimate, RetractionOutcome)> {
        let context = RetractionContext {
            imu: &self.imu,
            noise: &self.noise,
            thresholds: &self.config.repropagation,
            min_curvature: self.config.lane.min_curvature,
        };
        estimate.retracted(step, layout, &context, finalize)
    }
}

fn assemble(factors: &[FactorBlock], dim: usize) -> (DMatrix<f64>, DVector<f64>) {
    let rows: usize = factors.iter().map(FactorBlock::rows).sum();
    let mut jacobian = DMatrix::zeros(rows, dim);
    let mut residual = DVector::zeros(rows);

    let mut row = 0;
    for factor in factors {
        let height = factor.rows();
        residual.rows_mut(row, height).copy_from(&factor.residual);
        for block in &factor.blocks {
            let mut target = jacobian.view_mut((row, block.column), (height, block.values.ncols()));
            target += &block.values;
        }
        row += height;
    }
    (jacobian, residual)
}

fn state_at(states: &[State], index: usize) -> FusionResult<&State> {
    states
        .get(index)
        .ok_or_else(|| FusionError::InvalidInput(format!("no state with index {index}")))
}

fn bias_at(biases: &[Bias], index: usize) -> FusionResult<&Bias> {
    biases
        .get(index)
        .ok_or_else(|| FusionError::InvalidInput(format!("no bias with index {index}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::JacobianBlock;

    #[test]
    fn blocks_on_shared_columns_accumulate() {
        let factors = vec![
            FactorBlock {
                residual: DVector::from_vec(vec![1.0, 2.0]),
                blocks: vec![
                    JacobianBlock {
                        column: 1,
                        values: DMatrix::from_element(2, 2, 1.0),
                    },
                    JacobianBlock {
                        column: 2,
                        values: DMatrix::from_element(2, 1, 3.0),
                    },
                ],
            },
            FactorBlock::new(DVector::from_vec(vec![-1.0]))
                .with_block(0, DMatrix::from_element(1, 1, 5.0)),
        ];
        let (jacobian, residual) = assemble(&factors, 4);
        assert_eq!(residual.as_slice(), &[1.0, 2.0, -1.0]);
        assert_eq!(jacobian[(0, 1)], 1.0);
        assert_eq!(jacobian[(0, 2)], 4.0);
        assert_eq!(jacobian[(1, 3)], 0.0);
        assert_eq!(jacobian[(2, 0)], 5.0);
    }

    #[test]
    fn predicted_reduction_of_the_gauss_newton_step() {
        // One-dimensional r(x) = 2x − 4 at x = 0: the full step predicts the whole cost away.
        let linearization = Linearization {
            jacobian: DMatrix::from_element(1, 1, 2.0),
            residual: DVector::from_element(1, -4.0),
            skipped_lane_points: 0,
        };
        let step = DVector::from_element(1, 2.0);
        assert_eq!(linearization.cost(), 8.0);
        assert_eq!(linearization.predicted_reduction(&step), 8.0);
        assert_eq!(linearization.gradient()[0], -8.0);
    }
}
