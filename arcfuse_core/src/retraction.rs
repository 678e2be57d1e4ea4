// arcfuse_core/src/retraction.rs

//! Applying an optimization step to the estimate.
//!
//! Retraction never mutates: it returns the trial estimate, so a rejected step
//! is simply dropped.

use nalgebra::{DVector, Vector3};
use tracing::debug;

use crate::config::RepropagationThresholds;
use crate::error::{FusionError, FusionResult};
use crate::imu::{ImuCluster, ImuNoise};
use crate::lane::{clamp_curvature, ArcSegment};
use crate::layout::{Layout, ACCEL, ANCHOR_DIM, GYRO, POS, ROT, VEL};
use crate::manifold::{exp_so3, orthonormalized};
use crate::messages::ImuInterval;
use crate::types::{Bias, State};

/// Everything retraction needs besides the estimate itself.
#[derive(Debug, Clone, Copy)]
pub struct RetractionContext<'a> {
    /// Raw samples of every interval, for re-integration.
    pub imu: &'a [ImuInterval],
    pub noise: &'a ImuNoise,
    pub thresholds: &'a RepropagationThresholds,
    pub min_curvature: f64,
}

/// The full set of estimated quantities.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    pub states: Vec<State>,
    pub biases: Vec<Bias>,
    /// `clusters[i]` links `states[i]` and `states[i + 1]`.
    pub clusters: Vec<ImuCluster>,
    pub segments: Vec<ArcSegment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetractionOutcome {
    /// Intervals that were pre-integrated again, in ascending order.
    pub reintegrated: Vec<usize>,
}

impl Estimate {
    /// Returns the estimate moved by `step`.
    ///
    /// With `finalize` every non-zero bias accumulator is folded into its
    /// nominal value, otherwise only those beyond their threshold.
    pub fn retracted(
        &self,
        step: &DVector<f64>,
        layout: &Layout,
        context: &RetractionContext<'_>,
        finalize: bool,
    ) -> FusionResult<(Estimate, RetractionOutcome)> {
        if step.len() != layout.dim() || !layout.matches(&self.segments) {
            return Err(FusionError::InvalidInput(format!(
                "step of length {} does not match the layout of dimension {}",
                step.len(),
                layout.dim()
            )));
        }

        let mut next = self.clone();

        // --- 1. States ---
        for (i, state) in next.states.iter_mut().enumerate() {
            let offset = layout.state(i);
            let d_rot = step.fixed_rows::<3>(offset + ROT).into_owned();
            let d_vel = step.fixed_rows::<3>(offset + VEL).into_owned();
            let d_pos = step.fixed_rows::<3>(offset + POS).into_owned();

            state.position += state.rotation * d_pos;
            state.velocity += d_vel;
            if d_rot != Vector3::zeros() {
                // Products of many small rotations drift off SO(3).
                state.rotation = orthonormalized(&(state.rotation * exp_so3(&d_rot)));
            }

            if let (Some(scale), Some(col)) = (state.wheel_scale.as_mut(), layout.wheel_scale(i)) {
                *scale += step[col];
            }
        }

        // --- 2. Biases, folding what crossed its threshold ---
        let mut outcome = RetractionOutcome::default();
        for (i, bias) in next.biases.iter_mut().enumerate() {
            let offset = layout.bias(i);
            bias.delta_gyro += step.fixed_rows::<3>(offset + GYRO);
            bias.delta_accel += step.fixed_rows::<3>(offset + ACCEL);

            let gyro_norm = bias.delta_gyro.norm();
            let accel_norm = bias.delta_accel.norm();
            let fold_gyro = gyro_norm > context.thresholds.gyro || (finalize && gyro_norm > 0.0);
            let fold_accel =
                accel_norm > context.thresholds.accel || (finalize && accel_norm > 0.0);
            if fold_gyro {
                bias.gyro += bias.delta_gyro;
                bias.delta_gyro = Vector3::zeros();
            }
            if fold_accel {
                bias.accel += bias.delta_accel;
                bias.delta_accel = Vector3::zeros();
            }
            if (fold_gyro || fold_accel) && i < next.clusters.len() {
                outcome.reintegrated.push(i);
            }
        }

        for &i in &outcome.reintegrated {
            let interval = context.imu.get(i).ok_or_else(|| {
                FusionError::InvalidInput(format!("no IMU samples for interval {i}"))
            })?;
            let bias = &next.biases[i];
            next.clusters[i] = ImuCluster::integrate(
                i,
                next.states[i].timestamp,
                interval,
                bias.gyro,
                bias.accel,
                context.noise,
            )?;
            debug!(interval = i, "re-integrated IMU interval");
        }

        // --- 3. Arc-spline parameters ---
        for (s, segment) in next.segments.iter_mut().enumerate() {
            let Some(offset) = layout.segment(s) else {
                continue;
            };
            segment.anchor.x += step[offset];
            segment.anchor.y += step[offset + 1];
            segment.anchor.heading += step[offset + 2];

            let m = segment.len();
            for (t, sub) in segment.subsegments.iter_mut().enumerate() {
                sub.curvature = clamp_curvature(
                    sub.curvature + step[offset + ANCHOR_DIM + t],
                    context.min_curvature,
                );
                sub.sqrt_length += step[offset + ANCHOR_DIM + m + t];
            }
        }

        Ok((next, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FusionMode;
    use crate::layout::Capabilities;
    use crate::lane::{ArcPose, SubSegment};
    use crate::messages::{ImuSample, LanePointRef, LaneSide};
    use crate::types::LaneWindow;
    use nalgebra::Rotation3;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    const NUM_STATES: usize = 4;

    fn noise() -> ImuNoise {
        ImuNoise {
            gyro_std: 1e-3,
            accel_std: 1e-2,
            integration_std: 1e-4,
        }
    }

    fn intervals() -> Vec<ImuInterval> {
        (0..NUM_STATES - 1)
            .map(|i| {
                let start = i as f64;
                ImuInterval {
                    end_time: start + 1.0,
                    samples: (0..10)
                        .map(|k| ImuSample {
                            timestamp: start + k as f64 * 0.1,
                            accel: Vector3::new(0.2, 0.0, 9.81),
                            gyro: Vector3::new(0.0, 0.0, 0.05),
                        })
                        .collect(),
                }
            })
            .collect()
    }

    fn estimate(imu: &[ImuInterval]) -> Estimate {
        let states = (0..NUM_STATES)
            .map(|i| State {
                timestamp: i as f64,
                rotation: Rotation3::from_euler_angles(0.01, -0.02, 0.3 * i as f64),
                velocity: Vector3::new(10.0, 0.5, 0.0),
                position: Vector3::new(10.0 * i as f64, 1.0, 0.2),
                wheel_scale: Some(1.0),
                lanes: LaneWindow::default(),
            })
            .collect();
        let biases = vec![Bias::new(Vector3::new(1e-3, 0.0, 0.0), Vector3::zeros()); NUM_STATES];
        let clusters = imu
            .iter()
            .enumerate()
            .map(|(i, interval)| {
                ImuCluster::integrate(i, i as f64, interval, biases[i].gyro, biases[i].accel, &noise())
                    .unwrap()
            })
            .collect();
        let segment = ArcSegment {
            side: LaneSide::Left,
            anchor: ArcPose::new(0.0, 2.0, 0.1),
            subsegments: vec![
                SubSegment {
                    curvature: 0.01,
                    sqrt_length: 3.0,
                    bounds: (0, 1),
                    invalid_points: 0,
                },
                SubSegment {
                    curvature: -0.02,
                    sqrt_length: 2.0,
                    bounds: (2, 3),
                    invalid_points: 0,
                },
            ],
            points: (0..4)
                .map(|k| LanePointRef {
                    state_index: k,
                    side: LaneSide::Left,
                    preview_index: 0,
                })
                .collect(),
        };
        Estimate {
            states,
            biases,
            clusters,
            segments: vec![segment],
        }
    }

    fn setup() -> (Vec<ImuInterval>, Estimate, Layout) {
        let imu = intervals();
        let estimate = estimate(&imu);
        let layout = Layout::new(
            NUM_STATES,
            Capabilities::for_mode(FusionMode::Full),
            &estimate.segments,
        );
        (imu, estimate, layout)
    }

    #[test]
    fn zero_step_is_bit_exact() {
        let (imu, estimate, layout) = setup();
        let thresholds = RepropagationThresholds::default();
        let context = RetractionContext {
            imu: &imu,
            noise: &noise(),
            thresholds: &thresholds,
            min_curvature: 1e-6,
        };
        let (next, outcome) = estimate
            .retracted(&DVector::zeros(layout.dim()), &layout, &context, false)
            .unwrap();
        assert_eq!(next, estimate);
        assert!(outcome.reintegrated.is_empty());
    }

    #[test]
    fn small_bias_deltas_reuse_clusters() {
        let (imu, estimate, layout) = setup();
        let thresholds = RepropagationThresholds::default();
        let context = RetractionContext {
            imu: &imu,
            noise: &noise(),
            thresholds: &thresholds,
            min_curvature: 1e-6,
        };
        let mut step = DVector::zeros(layout.dim());
        for i in 0..NUM_STATES {
            step[layout.bias(i) + GYRO + 2] = 0.004;
            step[layout.bias(i) + ACCEL] = 0.04;
        }
        let (once, outcome) = estimate.retracted(&step, &layout, &context, false).unwrap();
        assert!(outcome.reintegrated.is_empty());
        let (twice, outcome) = once.retracted(&step, &layout, &context, false).unwrap();
        assert!(outcome.reintegrated.is_empty());
        assert_eq!(twice.clusters, estimate.clusters);
        assert_eq!(twice.biases[1].gyro, estimate.biases[1].gyro);
        assert!((twice.biases[1].delta_gyro.z - 0.008).abs() < 1e-15);
    }

    #[test]
    fn gyro_bias_step_reintegrates_only_its_interval() {
        let (imu, estimate, layout) = setup();
        let thresholds = RepropagationThresholds {
            gyro: 0.01,
            accel: 0.1,
        };
        let context = RetractionContext {
            imu: &imu,
            noise: &noise(),
            thresholds: &thresholds,
            min_curvature: 1e-6,
        };
        let mut step = DVector::zeros(layout.dim());
        step[layout.bias(1) + GYRO + 2] = 0.05;

        let (next, outcome) = estimate.retracted(&step, &layout, &context, false).unwrap();

        assert_eq!(outcome.reintegrated, vec![1]);
        assert_eq!(next.biases[1].delta_gyro, Vector3::zeros());
        assert!((next.biases[1].gyro.z - 0.05).abs() < 1e-15);
        assert_eq!(next.clusters[0], estimate.clusters[0]);
        assert_eq!(next.clusters[2], estimate.clusters[2]);
        assert_ne!(next.clusters[1], estimate.clusters[1]);
        assert_eq!(next.clusters[1].bias_gyro, next.biases[1].gyro);
    }

    #[test]
    fn finalize_folds_every_accumulator() {
        let (imu, estimate, layout) = setup();
        let thresholds = RepropagationThresholds::default();
        let context = RetractionContext {
            imu: &imu,
            noise: &noise(),
            thresholds: &thresholds,
            min_curvature: 1e-6,
        };
        let mut step = DVector::zeros(layout.dim());
        step[layout.bias(0) + ACCEL + 1] = 1e-3;
        step[layout.bias(3) + GYRO] = 1e-4;
        let (next, outcome) = estimate.retracted(&step, &layout, &context, true).unwrap();
        // Untouched biases need no work and the last one has no outgoing interval.
        assert_eq!(outcome.reintegrated, vec![0]);
        assert!(next.biases.iter().all(|b| b.delta_gyro == Vector3::zeros()));
        assert!((next.biases[3].gyro.x - 1.1e-3).abs() < 1e-15);
    }

    #[test]
    fn arc_lengths_stay_positive_under_random_steps() {
        let (imu, mut estimate, layout) = setup();
        let thresholds = RepropagationThresholds::default();
        let context = RetractionContext {
            imu: &imu,
            noise: &noise(),
            thresholds: &thresholds,
            min_curvature: 1e-6,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let dist = Normal::new(0.0, 2.0).unwrap();
        let segment_offset = layout.segment(0).unwrap();
        for _ in 0..200 {
            let mut step = DVector::zeros(layout.dim());
            for col in segment_offset..layout.dim() {
                step[col] = dist.sample(&mut rng);
            }
            estimate = estimate.retracted(&step, &layout, &context, false).unwrap().0;
            for sub in &estimate.segments[0].subsegments {
                assert!(sub.length() > 0.0);
                assert!(sub.curvature.abs() >= 1e-6);
            }
        }
    }

    #[test]
    fn repeated_rotation_steps_stay_orthonormal() {
        let (imu, mut estimate, layout) = setup();
        let thresholds = RepropagationThresholds::default();
        let context = RetractionContext {
            imu: &imu,
            noise: &noise(),
            thresholds: &thresholds,
            min_curvature: 1e-6,
        };
        let mut step = DVector::zeros(layout.dim());
        step[layout.state(1) + ROT] = 1e-7;
        step[layout.state(1) + ROT + 2] = -3e-8;
        for _ in 0..1000 {
            estimate = estimate.retracted(&step, &layout, &context, false).unwrap().0;
        }
        let rotation = estimate.states[1].rotation.matrix();
        let gram = rotation * rotation.transpose();
        assert!((gram - nalgebra::Matrix3::identity()).amax() < 1e-14);
        assert!(crate::manifold::log_so3(&estimate.states[1].rotation)
            .iter()
            .all(|v| v.is_finite()));
    }

    #[test]
    fn position_step_is_applied_in_the_body_frame() {
        let (imu, estimate, layout) = setup();
        let thresholds = RepropagationThresholds::default();
        let context = RetractionContext {
            imu: &imu,
            noise: &noise(),
            thresholds: &thresholds,
            min_curvature: 1e-6,
        };
        let mut step = DVector::zeros(layout.dim());
        step[layout.state(2) + POS] = 1.0;
        let (next, _) = estimate.retracted(&step, &layout, &context, false).unwrap();
        let expected = estimate.states[2].position + estimate.states[2].rotation * Vector3::x();
        assert!((next.states[2].position - expected).norm() < 1e-12);
    }
}
