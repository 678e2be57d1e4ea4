// arcfuse_core/src/manifold.rs

//! SO(3) operations used wherever a rotation is perturbed or a rotation
//! residual is linearized.
//!
//! Conventions follow right perturbation: `R ⊕ δφ = R · Exp(δφ)`.

use nalgebra::{Matrix3, Rotation3, Unit, UnitQuaternion, Vector3};

/// Below this angle the closed forms are replaced by their Taylor expansions.
const SMALL_ANGLE: f64 = 1e-8;
/// Below this cosine the logarithm is taken through a quaternion, where the
/// antisymmetric part of the matrix no longer carries the axis.
const NEAR_PI_COS: f64 = -0.9;

/// Skew-symmetric matrix `[v]×` such that `[v]× u = v × u`.
#[inline]
#[rustfmt::skip]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Exponential map from the tangent space to the rotation group.
///
/// Rodrigues' formula at every angle, so the result is orthonormal to rounding
/// even for tiny vectors; a zero vector maps to the exact identity.
pub fn exp_so3(phi: &Vector3<f64>) -> Rotation3<f64> {
    let theta = phi.norm();
    if theta == 0.0 {
        return Rotation3::identity();
    }
    Rotation3::from_axis_angle(&Unit::new_unchecked(phi / theta), theta)
}

/// Logarithm map from the rotation group to its tangent space.
///
/// The angle comes from `atan2(sin θ, cos θ)` with the cosine clamped, so a
/// matrix whose trace drifted past 3 still maps to a finite vector.
pub fn log_so3(rotation: &Rotation3<f64>) -> Vector3<f64> {
    let m = rotation.matrix();
    let antisymmetric = Vector3::new(
        m[(2, 1)] - m[(1, 2)],
        m[(0, 2)] - m[(2, 0)],
        m[(1, 0)] - m[(0, 1)],
    );
    let cos = (0.5 * (m.trace() - 1.0)).clamp(-1.0, 1.0);
    if cos < NEAR_PI_COS {
        return orthonormalized_quaternion(rotation).scaled_axis();
    }
    let sin = 0.5 * antisymmetric.norm();
    let theta = sin.atan2(cos);
    if theta < SMALL_ANGLE {
        return 0.5 * antisymmetric;
    }
    antisymmetric * (theta / (2.0 * sin))
}

fn orthonormalized_quaternion(rotation: &Rotation3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::new_normalize(*UnitQuaternion::from_rotation_matrix(rotation).quaternion())
}

/// The nearest proper rotation to a matrix that drifted off SO(3) by rounding.
pub fn orthonormalized(rotation: &Rotation3<f64>) -> Rotation3<f64> {
    orthonormalized_quaternion(rotation).to_rotation_matrix()
}

/// Right Jacobian of SO(3).
///
/// ```text
/// Jr(φ) = I - (1 - cos θ)/θ² [φ]× + (θ - sin θ)/θ³ [φ]×²
/// ```
pub fn right_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let phi_x = skew(phi);
    if theta < SMALL_ANGLE {
        return Matrix3::identity() - 0.5 * phi_x;
    }
    let theta_sq = theta * theta;
    Matrix3::identity() - ((1.0 - theta.cos()) / theta_sq) * phi_x
        + ((theta - theta.sin()) / (theta_sq * theta)) * phi_x * phi_x
}

/// Inverse of the right Jacobian of SO(3).
///
/// ```text
/// Jr⁻¹(φ) = I + ½[φ]× + (1/θ² - (1 + cos θ)/(2θ sin θ)) [φ]×²
/// ```
pub fn right_jacobian_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let phi_x = skew(phi);
    if theta < SMALL_ANGLE {
        return Matrix3::identity() + 0.5 * phi_x + (1.0 / 12.0) * phi_x * phi_x;
    }
    let theta_sq = theta * theta;
    let coeff = 1.0 / theta_sq - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Matrix3::identity() + 0.5 * phi_x + coeff * phi_x * phi_x
}

/// Heading (yaw about the world up axis) of a body rotation.
pub fn heading(rotation: &Rotation3<f64>) -> f64 {
    let forward = rotation * Vector3::x();
    forward.y.atan2(forward.x)
}

/// Wraps an angle into `(-π, π]`.
pub fn wrap_angle(angle: f64) -> f64 {
    let two_pi = 2.0 * std::f64::consts::PI;
    let wrapped = (angle + std::f64::consts::PI).rem_euclid(two_pi) - std::f64::consts::PI;
    if wrapped <= -std::f64::consts::PI {
        wrapped + two_pi
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn skew_matches_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(-4.0, 0.5, 6.0);
        assert_relative_eq!(skew(&v) * u, v.cross(&u), epsilon = 1e-12);
    }

    #[test]
    fn exp_of_zero_is_exact_identity() {
        let r = exp_so3(&Vector3::zeros());
        assert_eq!(r.matrix(), &Matrix3::identity());
    }

    #[test]
    fn exp_of_a_tiny_vector_is_orthonormal() {
        let r = exp_so3(&Vector3::new(1e-9, -2e-9, 5e-10));
        let gram = r.matrix() * r.matrix().transpose();
        assert_relative_eq!(gram, Matrix3::identity(), epsilon = 1e-14);
    }

    #[test]
    fn log_survives_a_trace_above_three() {
        let drifted = Rotation3::from_matrix_unchecked(Matrix3::from_diagonal_element(1.0 + 1e-14 / 3.0));
        assert!(drifted.matrix().trace() > 3.0);
        let phi = log_so3(&drifted);
        assert!(phi.iter().all(|v| v.is_finite()));
        assert!(phi.norm() < 1e-12);
    }

    #[test]
    fn log_of_a_drifted_small_rotation_keeps_its_angle() {
        let phi = Vector3::new(0.0, 0.0, 1e-7);
        let mut matrix = exp_so3(&phi).into_inner();
        for k in 0..3 {
            matrix[(k, k)] = 1.000_000_000_000_008_4;
        }
        let log = log_so3(&Rotation3::from_matrix_unchecked(matrix));
        assert_relative_eq!(log, phi, epsilon = 1e-12);
    }

    #[test]
    fn log_near_pi_round_trips() {
        let phi = Vector3::new(1.0, -2.0, 0.5).normalize() * (std::f64::consts::PI - 1e-4);
        assert_relative_eq!(log_so3(&exp_so3(&phi)), phi, epsilon = 1e-9);
    }

    #[test]
    fn orthonormalized_restores_the_rotation() {
        let r = exp_so3(&Vector3::new(0.2, 0.1, -0.4));
        let drifted = Rotation3::from_matrix_unchecked(r.matrix() * (1.0 + 1e-10));
        let fixed = orthonormalized(&drifted);
        let gram = fixed.matrix() * fixed.matrix().transpose();
        assert_relative_eq!(gram, Matrix3::identity(), epsilon = 1e-14);
        assert_relative_eq!(fixed.matrix(), r.matrix(), epsilon = 1e-9);
    }

    #[test]
    fn exp_log_round_trip() {
        let phi = Vector3::new(0.3, -0.2, 0.9);
        assert_relative_eq!(log_so3(&exp_so3(&phi)), phi, epsilon = 1e-12);
    }

    #[test]
    fn right_jacobian_times_inverse_is_identity() {
        let phi = Vector3::new(0.1, 0.2, -0.3);
        let product = right_jacobian(&phi) * right_jacobian_inv(&phi);
        assert_relative_eq!(product, Matrix3::identity(), epsilon = 1e-10);
    }

    #[test]
    fn right_jacobian_linearizes_exp() {
        // Exp(φ + δ) ≈ Exp(φ) Exp(Jr(φ) δ)
        let phi = Vector3::new(0.4, -0.1, 0.2);
        let delta = Vector3::new(1e-6, -2e-6, 3e-6);
        let lhs = exp_so3(&(phi + delta));
        let rhs = exp_so3(&phi) * exp_so3(&(right_jacobian(&phi) * delta));
        assert_relative_eq!(lhs.matrix(), rhs.matrix(), epsilon = 1e-10);
    }

    #[test]
    fn wrap_angle_stays_in_range() {
        let pi = std::f64::consts::PI;
        assert_relative_eq!(wrap_angle(2.5 * pi), 0.5 * pi, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(-0.5), -0.5);
        assert_relative_eq!(wrap_angle(7.0), 7.0 - 2.0 * std::f64::consts::PI, epsilon = 1e-12);
    }
}
