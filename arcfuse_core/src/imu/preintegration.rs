// arcfuse_core/src/imu/preintegration.rs

use nalgebra::{Matrix3, Rotation3, SMatrix, Vector3};

use crate::config::NoiseConfig;
use crate::error::{FusionError, FusionResult};
use crate::manifold::{exp_so3, right_jacobian, skew};
use crate::messages::ImuInterval;

pub type Matrix9 = SMatrix<f64, 9, 9>;
type Matrix9x6 = SMatrix<f64, 9, 6>;
type Matrix6 = SMatrix<f64, 6, 6>;

/// Per-sample noise figures the covariance recursion is driven by.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuNoise {
    pub gyro_std: f64,
    pub accel_std: f64,
    pub integration_std: f64,
}

impl From<&NoiseConfig> for ImuNoise {
    fn from(config: &NoiseConfig) -> Self {
        Self {
            gyro_std: config.gyro_noise_std,
            accel_std: config.accel_noise_std,
            integration_std: config.integration_noise_std,
        }
    }
}

/// Pre-integrated relative motion between two consecutive states.
///
/// All increments are expressed in the body frame of the start state and do
/// not include gravity. The covariance is ordered `[rotation, velocity,
/// position]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImuCluster {
    pub delta_rotation: Rotation3<f64>,
    pub delta_velocity: Vector3<f64>,
    pub delta_position: Vector3<f64>,

    /// ∂ΔR/∂bg
    pub d_rot_d_gyro: Matrix3<f64>,
    /// ∂Δv/∂bg
    pub d_vel_d_gyro: Matrix3<f64>,
    /// ∂Δv/∂ba
    pub d_vel_d_accel: Matrix3<f64>,
    /// ∂Δp/∂bg
    pub d_pos_d_gyro: Matrix3<f64>,
    /// ∂Δp/∂ba
    pub d_pos_d_accel: Matrix3<f64>,

    pub covariance: Matrix9,
    /// Total integrated time (s).
    pub dt: f64,

    /// Bias the increments were integrated with.
    pub bias_gyro: Vector3<f64>,
    pub bias_accel: Vector3<f64>,
}

impl ImuCluster {
    fn identity(bias_gyro: Vector3<f64>, bias_accel: Vector3<f64>) -> Self {
        Self {
            delta_rotation: Rotation3::identity(),
            delta_velocity: Vector3::zeros(),
            delta_position: Vector3::zeros(),
            d_rot_d_gyro: Matrix3::zeros(),
            d_vel_d_gyro: Matrix3::zeros(),
            d_vel_d_accel: Matrix3::zeros(),
            d_pos_d_gyro: Matrix3::zeros(),
            d_pos_d_accel: Matrix3::zeros(),
            covariance: Matrix9::zeros(),
            dt: 0.0,
            bias_gyro,
            bias_accel,
        }
    }

    /// Integrates one inter-state interval.
    ///
    /// `index` only labels errors. Sample `k` is held from its timestamp (the
    /// first one from `start_time`) until the next sample, the last one until
    /// `interval.end_time`.
    ///
    /// # Errors
    /// `EmptyImuInterval` when no sample has a positive duration and
    /// `CovarianceNotPositiveDefinite` when the propagated covariance fails a
    /// Cholesky factorization.
    pub fn integrate(
        index: usize,
        start_time: f64,
        interval: &ImuInterval,
        bias_gyro: Vector3<f64>,
        bias_accel: Vector3<f64>,
        noise: &ImuNoise,
    ) -> FusionResult<Self> {
        let mut cluster = Self::identity(bias_gyro, bias_accel);

        let mut q = Matrix6::zeros();
        q.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(Matrix3::identity() * noise.gyro_std.powi(2)));
        q.fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&(Matrix3::identity() * noise.accel_std.powi(2)));

        let samples = &interval.samples;
        for (k, sample) in samples.iter().enumerate() {
            let t0 = if k == 0 { start_time } else { sample.timestamp };
            let t1 = samples
                .get(k + 1)
                .map_or(interval.end_time, |next| next.timestamp);
            let dt = t1 - t0;
            if dt <= 0.0 {
                continue;
            }
            cluster.step(sample.gyro - bias_gyro, sample.accel - bias_accel, dt, &q, noise);
        }

        if cluster.dt <= 0.0 {
            return Err(FusionError::EmptyImuInterval { interval: index });
        }

        // Tiny asymmetries from the recursion would otherwise leak into the weights.
        cluster.covariance = (cluster.covariance + cluster.covariance.transpose()) * 0.5;
        if cluster.covariance.cholesky().is_none() {
            return Err(FusionError::CovarianceNotPositiveDefinite { interval: index });
        }

        Ok(cluster)
    }

    /// One forward-Euler step with bias-corrected rates.
    fn step(
        &mut self,
        omega: Vector3<f64>,
        accel: Vector3<f64>,
        dt: f64,
        q: &Matrix6,
        noise: &ImuNoise,
    ) {
        let dt2 = dt * dt;
        let d_r = self.delta_rotation.matrix().clone_owned();
        let accel_x = skew(&accel);
        let phi = omega * dt;
        let step_rotation = exp_so3(&phi);
        let jr = right_jacobian(&phi);

        // --- 1. Covariance: Σ = A Σ Aᵀ + B Q Bᵀ + G ---
        let mut a = Matrix9::identity();
        a.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&step_rotation.matrix().transpose());
        a.fixed_view_mut::<3, 3>(3, 0)
            .copy_from(&(-d_r * accel_x * dt));
        a.fixed_view_mut::<3, 3>(6, 0)
            .copy_from(&(-0.5 * d_r * accel_x * dt2));
        a.fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(Matrix3::identity() * dt));

        let mut b = Matrix9x6::zeros();
        b.fixed_view_mut::<3, 3>(0, 0).copy_from(&(jr * dt));
        b.fixed_view_mut::<3, 3>(3, 3).copy_from(&(d_r * dt));
        b.fixed_view_mut::<3, 3>(6, 3).copy_from(&(0.5 * d_r * dt2));

        self.covariance = a * self.covariance * a.transpose() + b * q * b.transpose();
        for i in 6..9 {
            self.covariance[(i, i)] += noise.integration_std.powi(2) * dt;
        }

        // --- 2. Bias Jacobians (use the pre-step rotation) ---
        self.d_pos_d_accel += self.d_vel_d_accel * dt - 0.5 * d_r * dt2;
        self.d_pos_d_gyro += self.d_vel_d_gyro * dt - 0.5 * d_r * accel_x * self.d_rot_d_gyro * dt2;
        self.d_vel_d_accel -= d_r * dt;
        self.d_vel_d_gyro -= d_r * accel_x * self.d_rot_d_gyro * dt;
        self.d_rot_d_gyro = step_rotation.matrix().transpose() * self.d_rot_d_gyro - jr * dt;

        // --- 3. Increments ---
        let accel_rotated = d_r * accel;
        self.delta_position += self.delta_velocity * dt + 0.5 * accel_rotated * dt2;
        self.delta_velocity += accel_rotated * dt;
        self.delta_rotation *= step_rotation;
        self.dt += dt;
    }

    /// ΔR corrected to first order for a gyro bias offset from `bias_gyro`.
    pub fn corrected_rotation(&self, delta_gyro: &Vector3<f64>) -> Rotation3<f64> {
        self.delta_rotation * exp_so3(&(self.d_rot_d_gyro * delta_gyro))
    }

    /// Δv corrected to first order for bias offsets.
    pub fn corrected_velocity(&self, delta_gyro: &Vector3<f64>, delta_accel: &Vector3<f64>) -> Vector3<f64> {
        self.delta_velocity + self.d_vel_d_gyro * delta_gyro + self.d_vel_d_accel * delta_accel
    }

    /// Δp corrected to first order for bias offsets.
    pub fn corrected_position(&self, delta_gyro: &Vector3<f64>, delta_accel: &Vector3<f64>) -> Vector3<f64> {
        self.delta_position + self.d_pos_d_gyro * delta_gyro + self.d_pos_d_accel * delta_accel
    }

    /// Chains this increment onto a start state: returns `(R, v, p)` at the end.
    pub fn predict(
        &self,
        rotation: &Rotation3<f64>,
        velocity: &Vector3<f64>,
        position: &Vector3<f64>,
        gravity: &Vector3<f64>,
    ) -> (Rotation3<f64>, Vector3<f64>, Vector3<f64>) {
        let dt = self.dt;
        let new_rotation = rotation * self.delta_rotation;
        let new_velocity = velocity + gravity * dt + rotation * self.delta_velocity;
        let new_position =
            position + velocity * dt + 0.5 * gravity * dt * dt + rotation * self.delta_position;
        (new_rotation, new_velocity, new_position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ImuSample;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    fn noise() -> ImuNoise {
        ImuNoise {
            gyro_std: 1e-3,
            accel_std: 1e-2,
            integration_std: 1e-4,
        }
    }

    fn constant_interval(count: usize, rate: f64, gyro: Vector3<f64>, accel: Vector3<f64>) -> ImuInterval {
        let samples = (0..count)
            .map(|k| ImuSample {
                timestamp: k as f64 / rate,
                accel,
                gyro,
            })
            .collect();
        ImuInterval {
            end_time: count as f64 / rate,
            samples,
        }
    }

    #[test]
    fn single_sample_covariance_is_positive_definite() {
        let interval = constant_interval(1, 100.0, Vector3::zeros(), Vector3::new(0.0, 0.0, 9.81));
        let cluster =
            ImuCluster::integrate(0, 0.0, &interval, Vector3::zeros(), Vector3::zeros(), &noise())
                .unwrap();
        assert!(cluster.covariance.cholesky().is_some());
        assert_relative_eq!(cluster.dt, 0.01, epsilon = 1e-12);
    }

    #[test]
    fn random_inputs_keep_covariance_positive_definite() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let dist = Normal::new(0.0, 1.0).unwrap();
        for count in 1..40 {
            let samples = (0..count)
                .map(|k| ImuSample {
                    timestamp: k as f64 * 0.01,
                    accel: Vector3::new(dist.sample(&mut rng), dist.sample(&mut rng), 9.81),
                    gyro: Vector3::new(
                        0.3 * dist.sample(&mut rng),
                        0.3 * dist.sample(&mut rng),
                        0.3 * dist.sample(&mut rng),
                    ),
                })
                .collect();
            let interval = ImuInterval {
                end_time: count as f64 * 0.01,
                samples,
            };
            let cluster = ImuCluster::integrate(
                count,
                0.0,
                &interval,
                Vector3::zeros(),
                Vector3::zeros(),
                &noise(),
            )
            .unwrap();
            assert!(cluster.covariance.cholesky().is_some(), "count {count}");
        }
    }

    #[test]
    fn empty_interval_is_rejected() {
        let interval = ImuInterval {
            end_time: 0.0,
            samples: vec![],
        };
        let err = ImuCluster::integrate(3, 0.0, &interval, Vector3::zeros(), Vector3::zeros(), &noise())
            .unwrap_err();
        assert!(matches!(err, FusionError::EmptyImuInterval { interval: 3 }));
    }

    #[test]
    fn constant_acceleration_increments_match_kinematics() {
        let accel = Vector3::new(1.0, 0.0, 0.0);
        let interval = constant_interval(100, 100.0, Vector3::zeros(), accel);
        let cluster =
            ImuCluster::integrate(0, 0.0, &interval, Vector3::zeros(), Vector3::zeros(), &noise())
                .unwrap();
        assert_relative_eq!(cluster.delta_velocity, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-9);
        assert_relative_eq!(cluster.delta_position, Vector3::new(0.5, 0.0, 0.0), epsilon = 1e-9);
    }

    #[test]
    fn constant_rate_rotation_matches_exp() {
        let gyro = Vector3::new(0.0, 0.0, 0.2);
        let interval = constant_interval(50, 100.0, gyro, Vector3::zeros());
        let cluster =
            ImuCluster::integrate(0, 0.0, &interval, Vector3::zeros(), Vector3::zeros(), &noise())
                .unwrap();
        let expected = exp_so3(&(gyro * 0.5));
        assert_relative_eq!(cluster.delta_rotation.matrix(), expected.matrix(), epsilon = 1e-9);
    }

    #[test]
    fn bias_jacobians_match_reintegration() {
        let gyro = Vector3::new(0.05, -0.1, 0.3);
        let accel = Vector3::new(0.4, 0.2, 9.81);
        let interval = constant_interval(100, 100.0, gyro, accel);
        let base =
            ImuCluster::integrate(0, 0.0, &interval, Vector3::zeros(), Vector3::zeros(), &noise())
                .unwrap();

        let dbg = Vector3::new(1e-4, -2e-4, 1e-4);
        let dba = Vector3::new(-1e-3, 2e-3, 1e-3);
        let shifted = ImuCluster::integrate(0, 0.0, &interval, dbg, dba, &noise()).unwrap();

        let predicted_rotation = base.corrected_rotation(&dbg);
        assert_relative_eq!(
            predicted_rotation.matrix(),
            shifted.delta_rotation.matrix(),
            epsilon = 1e-6
        );
        assert_relative_eq!(
            base.corrected_velocity(&dbg, &dba),
            shifted.delta_velocity,
            epsilon = 1e-6
        );
        assert_relative_eq!(
            base.corrected_position(&dbg, &dba),
            shifted.delta_position,
            epsilon = 1e-6
        );
    }

    #[test]
    fn predict_free_fall_cancels_specific_force() {
        // A stationary IMU measures +g; predicting with gravity keeps it still.
        let interval = constant_interval(100, 100.0, Vector3::zeros(), Vector3::new(0.0, 0.0, 9.81));
        let cluster =
            ImuCluster::integrate(0, 0.0, &interval, Vector3::zeros(), Vector3::zeros(), &noise())
                .unwrap();
        let (_, v, p) = cluster.predict(
            &Rotation3::identity(),
            &Vector3::zeros(),
            &Vector3::zeros(),
            &Vector3::new(0.0, 0.0, -9.81),
        );
        assert_relative_eq!(v, Vector3::zeros(), epsilon = 1e-9);
        assert_relative_eq!(p, Vector3::zeros(), epsilon = 1e-9);
    }
}
