// arcfuse_sim/src/sensors/wheel.rs

use arcfuse_core::messages::WheelSpeedSample;
use nalgebra::Vector3;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::config::WheelSimConfig;
use crate::error::ScenarioError;
use crate::trajectory::TruthSample;

/// Generates the forward speed of the wheel point as an odometer with a scale
/// error reports it.
#[derive(Debug, Clone)]
pub struct WheelSynthesizer {
    scale: f64,
    lever_arm: Vector3<f64>,
    speed_noise: Normal<f64>,
}

impl WheelSynthesizer {
    pub fn new(config: &WheelSimConfig, lever_arm: [f64; 3]) -> Result<Self, ScenarioError> {
        if config.scale <= 0.0 {
            return Err(ScenarioError::Invalid(format!(
                "wheel scale must be positive, got {}",
                config.scale
            )));
        }
        if config.speed_noise_std < 0.0 {
            return Err(ScenarioError::Invalid(format!(
                "wheel speed noise std must not be negative, got {}",
                config.speed_noise_std
            )));
        }
        Ok(Self {
            scale: config.scale,
            lever_arm: Vector3::from(lever_arm),
            speed_noise: Normal::new(0.0, config.speed_noise_std)?,
        })
    }

    /// `raw_gyro` is the gyroscope reading at the sample time, bias included.
    pub fn sample<R: Rng>(
        &self,
        rng: &mut R,
        truth: &TruthSample,
        state_index: usize,
        raw_gyro: Vector3<f64>,
    ) -> WheelSpeedSample {
        let wheel_velocity = truth.rotation.inverse() * truth.velocity
            + truth.angular_rate.cross(&self.lever_arm);
        WheelSpeedSample {
            state_index,
            timestamp: truth.time,
            speed: wheel_velocity.x / self.scale + self.speed_noise.sample(rng),
            angular_rate: raw_gyro,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn config(scale: f64, speed_noise_std: f64) -> WheelSimConfig {
        WheelSimConfig {
            enabled: true,
            scale,
            speed_noise_std,
        }
    }

    #[test]
    fn speed_is_divided_by_the_scale() {
        let wheel = WheelSynthesizer::new(&config(1.25, 0.0), [0.0; 3]).unwrap();
        let truth = TruthSample {
            time: 2.0,
            rotation: Rotation3::from_euler_angles(0.0, 0.0, 0.7),
            velocity: Rotation3::from_euler_angles(0.0, 0.0, 0.7) * Vector3::new(10.0, 0.0, 0.0),
            position: Vector3::zeros(),
            acceleration: Vector3::zeros(),
            angular_rate: Vector3::zeros(),
        };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let sample = wheel.sample(&mut rng, &truth, 3, Vector3::zeros());
        assert_eq!(sample.state_index, 3);
        assert_relative_eq!(sample.speed, 8.0, epsilon = 1e-12);
    }

    #[test]
    fn negative_speed_noise_is_refused() {
        let err = WheelSynthesizer::new(&config(1.0, -0.05), [0.0; 3]).unwrap_err();
        assert!(matches!(err, ScenarioError::Invalid(_)));
    }

    #[test]
    fn non_positive_scale_is_refused() {
        let err = WheelSynthesizer::new(&config(0.0, 0.0), [0.0; 3]).unwrap_err();
        assert!(matches!(err, ScenarioError::Invalid(_)));
    }
}
