// arcfuse_core/src/factors/inertial.rs

//! The pre-integrated motion constraint between two consecutive states and
//! the bias random walk that accompanies it.

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

use super::{dense, FactorBlock};
use crate::config::NoiseConfig;
use crate::error::{FusionError, FusionResult};
use crate::imu::ImuCluster;
use crate::layout::{Layout, ACCEL, GYRO, POS, ROT, VEL};
use crate::manifold::{log_so3, right_jacobian, right_jacobian_inv, skew};
use crate::types::{Bias, State};

/// Gravity in the ENU world frame.
pub fn gravity_vector(magnitude: f64) -> Vector3<f64> {
    Vector3::new(0.0, 0.0, -magnitude)
}

/// Residual `[r_R, r_v, r_p]` between states `i` and `i + 1`, corrected to
/// first order for the bias accumulated since the interval was integrated.
pub fn inertial_block(
    index: usize,
    cluster: &ImuCluster,
    from: &State,
    to: &State,
    bias: &Bias,
    gravity: &Vector3<f64>,
    layout: &Layout,
) -> FusionResult<FactorBlock> {
    let dt = cluster.dt;
    let dbg = bias.delta_gyro;
    let dba = bias.delta_accel;

    let r_i_t = from.rotation.inverse();
    let r_i_t_mat = r_i_t.matrix().clone_owned();

    // --- 1. Residuals ---
    let corrected_rotation = cluster.corrected_rotation(&dbg);
    let error_rotation = corrected_rotation.inverse() * r_i_t * to.rotation;
    let r_rot = log_so3(&error_rotation);

    let velocity_world = to.velocity - from.velocity - gravity * dt;
    let r_vel = r_i_t * velocity_world - cluster.corrected_velocity(&dbg, &dba);

    let position_world =
        to.position - from.position - from.velocity * dt - 0.5 * gravity * dt * dt;
    let r_pos = r_i_t * position_world - cluster.corrected_position(&dbg, &dba);

    let mut residual = DVector::zeros(9);
    residual.fixed_rows_mut::<3>(ROT).copy_from(&r_rot);
    residual.fixed_rows_mut::<3>(VEL).copy_from(&r_vel);
    residual.fixed_rows_mut::<3>(POS).copy_from(&r_pos);

    // --- 2. Jacobians ---
    let jr_inv = right_jacobian_inv(&r_rot);
    let relative = (r_i_t * to.rotation).matrix().clone_owned();

    let mut j_from = DMatrix::zeros(9, 9);
    let mut j_to = DMatrix::zeros(9, 9);
    let mut j_bias = DMatrix::zeros(9, 6);

    // rotation row
    j_from
        .view_mut((ROT, ROT), (3, 3))
        .copy_from(&(-jr_inv * relative.transpose()));
    j_to.view_mut((ROT, ROT), (3, 3)).copy_from(&jr_inv);
    let correction = cluster.d_rot_d_gyro * dbg;
    j_bias.view_mut((ROT, GYRO), (3, 3)).copy_from(
        &(-jr_inv
            * error_rotation.matrix().transpose()
            * right_jacobian(&correction)
            * cluster.d_rot_d_gyro),
    );

    // velocity row
    j_from
        .view_mut((VEL, ROT), (3, 3))
        .copy_from(&skew(&(r_i_t * velocity_world)));
    j_from
        .view_mut((VEL, VEL), (3, 3))
        .copy_from(&(-r_i_t_mat));
    j_to.view_mut((VEL, VEL), (3, 3)).copy_from(&r_i_t_mat);
    j_bias
        .view_mut((VEL, GYRO), (3, 3))
        .copy_from(&(-cluster.d_vel_d_gyro));
    j_bias
        .view_mut((VEL, ACCEL), (3, 3))
        .copy_from(&(-cluster.d_vel_d_accel));

    // position row
    j_from
        .view_mut((POS, ROT), (3, 3))
        .copy_from(&skew(&(r_i_t * position_world)));
    j_from
        .view_mut((POS, VEL), (3, 3))
        .copy_from(&(-r_i_t_mat * dt));
    j_from
        .view_mut((POS, POS), (3, 3))
        .copy_from(&(-Matrix3::identity()));
    j_to.view_mut((POS, POS), (3, 3)).copy_from(&relative);
    j_bias
        .view_mut((POS, GYRO), (3, 3))
        .copy_from(&(-cluster.d_pos_d_gyro));
    j_bias
        .view_mut((POS, ACCEL), (3, 3))
        .copy_from(&(-cluster.d_pos_d_accel));

    FactorBlock::new(residual)
        .with_block(layout.state(index), j_from)
        .with_block(layout.state(index + 1), j_to)
        .with_block(layout.bias(index), j_bias)
        .whitened(dense(&cluster.covariance))
        .ok_or(FusionError::CovarianceNotPositiveDefinite { interval: index })
}

/// Random walk `b_{i+1} − b_i` over the interval duration.
pub fn bias_walk_block(
    index: usize,
    dt: f64,
    from: &Bias,
    to: &Bias,
    noise: &NoiseConfig,
    layout: &Layout,
) -> FactorBlock {
    let mut residual = DVector::zeros(6);
    residual
        .fixed_rows_mut::<3>(GYRO)
        .copy_from(&(to.effective_gyro() - from.effective_gyro()));
    residual
        .fixed_rows_mut::<3>(ACCEL)
        .copy_from(&(to.effective_accel() - from.effective_accel()));

    let root_dt = dt.max(f64::EPSILON).sqrt();
    let mut sigmas = vec![noise.gyro_bias_walk_std * root_dt; 3];
    sigmas.extend([noise.accel_bias_walk_std * root_dt; 3]);

    FactorBlock::new(residual)
        .with_block(layout.bias(index), -DMatrix::<f64>::identity(6, 6))
        .with_block(layout.bias(index + 1), DMatrix::identity(6, 6))
        .scaled(&sigmas)
}
