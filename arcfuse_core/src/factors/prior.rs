// arcfuse_core/src/factors/prior.rs

use nalgebra::{DMatrix, DVector, Matrix3, Rotation3, Vector3};

use super::{dense, FactorBlock};
use crate::config::PriorConfig;
use crate::layout::{Layout, ACCEL, GYRO, POS, ROT, VEL};
use crate::manifold::{log_so3, right_jacobian_inv};
use crate::types::{Bias, State};

/// Values of the first state, bias and scale factor before optimization.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorValues {
    pub rotation: Rotation3<f64>,
    pub velocity: Vector3<f64>,
    pub position: Vector3<f64>,
    pub gyro_bias: Vector3<f64>,
    pub accel_bias: Vector3<f64>,
    pub wheel_scale: Option<f64>,
}

impl PriorValues {
    pub fn capture(state: &State, bias: &Bias) -> Self {
        Self {
            rotation: state.rotation,
            velocity: state.velocity,
            position: state.position,
            gyro_bias: bias.effective_gyro(),
            accel_bias: bias.effective_accel(),
            wheel_scale: state.wheel_scale,
        }
    }
}

/// Pins the first state, bias and (when estimated) scale factor to their
/// pre-optimization values.
pub fn prior_block(
    prior: &PriorValues,
    state: &State,
    bias: &Bias,
    config: &PriorConfig,
    layout: &Layout,
) -> FactorBlock {
    // --- 1. Pose and velocity ---
    let r_rot = log_so3(&(prior.rotation.inverse() * state.rotation));
    let r_vel = state.velocity - prior.velocity;
    let r_pos = state.position - prior.position;

    let mut residual = DVector::zeros(9);
    residual.fixed_rows_mut::<3>(ROT).copy_from(&r_rot);
    residual.fixed_rows_mut::<3>(VEL).copy_from(&r_vel);
    residual.fixed_rows_mut::<3>(POS).copy_from(&r_pos);

    let mut j_state = DMatrix::zeros(9, 9);
    j_state
        .view_mut((ROT, ROT), (3, 3))
        .copy_from(&right_jacobian_inv(&r_rot));
    j_state
        .view_mut((VEL, VEL), (3, 3))
        .copy_from(&Matrix3::identity());
    j_state
        .view_mut((POS, POS), (3, 3))
        .copy_from(state.rotation.matrix());

    let mut sigmas = vec![config.rotation_std; 3];
    sigmas.extend([config.velocity_std; 3]);
    sigmas.extend([config.position_std; 3]);

    let state_block = FactorBlock::new(residual)
        .with_block(layout.state(0), j_state)
        .scaled(&sigmas);

    // --- 2. Bias ---
    let mut bias_residual = DVector::zeros(6);
    bias_residual
        .fixed_rows_mut::<3>(GYRO)
        .copy_from(&(bias.effective_gyro() - prior.gyro_bias));
    bias_residual
        .fixed_rows_mut::<3>(ACCEL)
        .copy_from(&(bias.effective_accel() - prior.accel_bias));
    let mut bias_sigmas = vec![config.gyro_bias_std; 3];
    bias_sigmas.extend([config.accel_bias_std; 3]);
    let bias_block = FactorBlock::new(bias_residual)
        .with_block(layout.bias(0), dense(&nalgebra::Matrix6::<f64>::identity()))
        .scaled(&bias_sigmas);

    let mut blocks = vec![state_block, bias_block];

    // --- 3. Wheel-scale factor ---
    if let (Some(col), Some(scale), Some(prior_scale)) =
        (layout.wheel_scale(0), state.wheel_scale, prior.wheel_scale)
    {
        blocks.push(
            FactorBlock::new(DVector::from_element(1, scale - prior_scale))
                .with_block(col, DMatrix::from_element(1, 1, 1.0))
                .scaled(&[config.wheel_scale_std]),
        );
    }

    FactorBlock::stack(blocks)
}
