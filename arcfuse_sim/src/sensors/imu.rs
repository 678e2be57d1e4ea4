// arcfuse_sim/src/sensors/imu.rs

use arcfuse_core::messages::{ImuInterval, ImuSample};
use nalgebra::Vector3;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::config::ImuSimConfig;
use crate::error::ScenarioError;
use crate::trajectory::TrajectoryGenerator;

/// Generates the IMU samples of every inter-state interval.
#[derive(Debug, Clone)]
pub struct ImuSynthesizer {
    rate: f64,
    gravity: Vector3<f64>,
    accel_noise: Normal<f64>,
    gyro_noise: Normal<f64>,
    gyro_bias: Vector3<f64>,
    accel_bias: Vector3<f64>,
    /// Extra gyro bias on one interval.
    bias_step: Option<(usize, Vector3<f64>)>,
}

impl ImuSynthesizer {
    pub fn new(config: &ImuSimConfig, rate: f64, gravity: Vector3<f64>) -> Result<Self, ScenarioError> {
        if rate <= 0.0 {
            return Err(ScenarioError::Invalid(format!("IMU rate must be positive, got {rate}")));
        }
        if config.gyro_noise_std < 0.0 || config.accel_noise_std < 0.0 {
            return Err(ScenarioError::Invalid(format!(
                "IMU noise std must not be negative, got gyro {} accel {}",
                config.gyro_noise_std, config.accel_noise_std
            )));
        }
        Ok(Self {
            rate,
            gravity,
            accel_noise: Normal::new(0.0, config.accel_noise_std)?,
            gyro_noise: Normal::new(0.0, config.gyro_noise_std)?,
            gyro_bias: Vector3::from(config.gyro_bias),
            accel_bias: Vector3::from(config.accel_bias),
            bias_step: config
                .bias_step
                .as_ref()
                .map(|step| (step.interval, Vector3::from(step.gyro))),
        })
    }

    /// True gyro bias during interval `index`.
    pub fn gyro_bias(&self, index: usize) -> Vector3<f64> {
        match self.bias_step {
            Some((interval, step)) if interval == index => self.gyro_bias + step,
            _ => self.gyro_bias,
        }
    }

    pub fn accel_bias(&self) -> Vector3<f64> {
        self.accel_bias
    }

    /// Samples of interval `index`, from `start` (inclusive) to `end`.
    pub fn interval<R: Rng>(
        &self,
        rng: &mut R,
        truth: &TrajectoryGenerator,
        index: usize,
        start: f64,
        end: f64,
    ) -> ImuInterval {
        let period = 1.0 / self.rate;
        let count = ((end - start) * self.rate - 1e-9).ceil().max(1.0) as usize;
        let gyro_bias = self.gyro_bias(index);

        let samples = (0..count)
            .map(|k| {
                let timestamp = start + k as f64 * period;
                // Held until the next sample, so read the truth at mid-hold.
                let hold_end = (timestamp + period).min(end);
                let state = truth.sample(0.5 * (timestamp + hold_end));
                ImuSample {
                    timestamp,
                    accel: state.specific_force(&self.gravity)
                        + self.accel_bias
                        + self.noise(rng, &self.accel_noise),
                    gyro: state.angular_rate + gyro_bias + self.noise(rng, &self.gyro_noise),
                }
            })
            .collect();

        ImuInterval {
            end_time: end,
            samples,
        }
    }

    fn noise<R: Rng>(&self, rng: &mut R, distribution: &Normal<f64>) -> Vector3<f64> {
        Vector3::new(
            distribution.sample(rng),
            distribution.sample(rng),
            distribution.sample(rng),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BiasStep, TrajectoryConfig};
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn interval_covers_its_span_at_the_rate() {
        let imu = ImuSynthesizer::new(&ImuSimConfig::default(), 100.0, Vector3::new(0.0, 0.0, -9.81)).unwrap();
        let truth = TrajectoryGenerator::new(&TrajectoryConfig::default());
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let interval = imu.interval(&mut rng, &truth, 0, 2.0, 3.0);
        assert_eq!(interval.samples.len(), 100);
        assert_relative_eq!(interval.samples[0].timestamp, 2.0);
        assert_relative_eq!(interval.samples[99].timestamp, 2.99, epsilon = 1e-9);
        assert_relative_eq!(interval.samples[0].accel, Vector3::new(0.0, 0.0, 9.81), epsilon = 1e-12);
    }

    #[test]
    fn bias_step_hits_one_interval() {
        let config = ImuSimConfig {
            bias_step: Some(BiasStep {
                interval: 2,
                gyro: [0.0, 0.0, 0.05],
            }),
            ..ImuSimConfig::default()
        };
        let imu = ImuSynthesizer::new(&config, 100.0, Vector3::new(0.0, 0.0, -9.81)).unwrap();
        assert_eq!(imu.gyro_bias(1), Vector3::zeros());
        assert_eq!(imu.gyro_bias(2), Vector3::new(0.0, 0.0, 0.05));
    }

    #[test]
    fn negative_noise_is_refused() {
        let config = ImuSimConfig {
            gyro_noise_std: -1.0,
            ..ImuSimConfig::default()
        };
        let err = ImuSynthesizer::new(&config, 100.0, Vector3::zeros()).unwrap_err();
        assert!(matches!(err, ScenarioError::Invalid(_)));

        let config = ImuSimConfig {
            accel_noise_std: -0.1,
            ..ImuSimConfig::default()
        };
        let err = ImuSynthesizer::new(&config, 100.0, Vector3::zeros()).unwrap_err();
        assert!(matches!(err, ScenarioError::Invalid(_)));
    }

    #[test]
    fn zero_noise_is_accepted() {
        let config = ImuSimConfig {
            gyro_noise_std: 0.0,
            accel_noise_std: 0.0,
            ..ImuSimConfig::default()
        };
        assert!(ImuSynthesizer::new(&config, 100.0, Vector3::zeros()).is_ok());
    }
}
