// arcfuse_core/src/factors/wheel.rs

//! Wheel-speed odometry with nonholonomic lateral/vertical constraints, and
//! the continuity of the wheel-scale factor between states.

use nalgebra::{DMatrix, DVector, Vector3};

use super::{dense, FactorBlock};
use crate::config::NoiseConfig;
use crate::layout::{Layout, GYRO, ROT, VEL};
use crate::manifold::skew;
use crate::messages::WheelSpeedSample;
use crate::types::{Bias, State};

/// Body-frame velocity of the wheel point against `[k·s, 0, 0]`.
pub fn wheel_block(
    sample: &WheelSpeedSample,
    state: &State,
    bias: &Bias,
    noise: &NoiseConfig,
    layout: &Layout,
) -> FactorBlock {
    let i = sample.state_index;
    let lever_arm = Vector3::from(noise.wheel_lever_arm);
    let scale = state.wheel_scale.unwrap_or(1.0);

    let velocity_body = state.rotation.inverse() * state.velocity;
    let omega = sample.angular_rate - bias.effective_gyro();
    let predicted = velocity_body + omega.cross(&lever_arm);
    let residual = predicted - Vector3::new(scale * sample.speed, 0.0, 0.0);

    let mut j_state = DMatrix::zeros(3, 9);
    j_state
        .view_mut((0, ROT), (3, 3))
        .copy_from(&skew(&velocity_body));
    j_state
        .view_mut((0, VEL), (3, 3))
        .copy_from(&state.rotation.matrix().transpose());

    let mut j_bias = DMatrix::zeros(3, 6);
    j_bias
        .view_mut((0, GYRO), (3, 3))
        .copy_from(&skew(&lever_arm));

    let mut block = FactorBlock::new(DVector::from_column_slice(residual.as_slice()))
        .with_block(layout.state(i), j_state)
        .with_block(layout.bias(i), j_bias);
    if let (Some(col), Some(_)) = (layout.wheel_scale(i), state.wheel_scale) {
        block = block.with_block(
            col,
            dense(&Vector3::new(-sample.speed, 0.0, 0.0)),
        );
    }
    block.scaled(&[
        noise.wheel_speed_std,
        noise.wheel_lateral_std,
        noise.wheel_vertical_std,
    ])
}

/// Scale-factor drift `k_{i+1} − k_i`.
pub fn wheel_scale_walk_block(index: usize, from: f64, to: f64, noise: &NoiseConfig, layout: &Layout) -> Option<FactorBlock> {
    let from_col = layout.wheel_scale(index)?;
    let to_col = layout.wheel_scale(index + 1)?;
    Some(
        FactorBlock::new(DVector::from_element(1, to - from))
            .with_block(from_col, DMatrix::from_element(1, 1, -1.0))
            .with_block(to_col, DMatrix::from_element(1, 1, 1.0))
            .scaled(&[noise.wheel_scale_walk_std]),
    )
}
