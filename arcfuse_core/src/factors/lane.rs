// arcfuse_core/src/factors/lane.rs

//! Lane preview points measured against the arc-spline model.
//!
//! The residual of a preview point owned by sub-segment `i` depends on the pose
//! of its state, the segment anchor and the parameters of sub-segments
//! `0..=i`. It is linearized numerically over that local parameter vector:
//!
//! ```text
//! [ δφ (3) | δp (3) | δx δy δψ | δκ₀..δκᵢ | δ√L₀..δ√Lᵢ ]
//! ```

use std::fmt::Debug;

use dyn_clone::DynClone;
use nalgebra::{DMatrix, DVector, Rotation3, Vector2, Vector3};
use tracing::warn;

use super::FactorBlock;
use crate::config::LaneConfig;
use crate::error::FusionResult;
use crate::lane::{clamp_curvature, level_lateral_std, level_offset, resolve, ArcPose, ArcSegment};
use crate::layout::{Layout, ANCHOR_DIM, POS, ROT};
use crate::manifold::{exp_so3, heading};
use crate::types::State;

/// Local columns shared by every lane-model Jacobian.
pub(crate) const POSE_DIM: usize = 6;

/// Strategy linearizing a lane-model residual.
///
/// `residual` is evaluated at a local perturbation; the linearization point is
/// the zero vector of length `dim`, where it evaluates to `base`. Returning
/// `None` means the residual left its domain for some perturbation.
pub trait LaneJacobian: DynClone + Debug + Send + Sync {
    fn jacobian(
        &self,
        residual: &dyn Fn(&DVector<f64>) -> Option<DVector<f64>>,
        base: &DVector<f64>,
        dim: usize,
    ) -> Option<DMatrix<f64>>;
}

dyn_clone::clone_trait_object!(LaneJacobian);

/// One-sided finite differences.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForwardDifference {
    pub step: f64,
}

impl LaneJacobian for ForwardDifference {
    fn jacobian(
        &self,
        residual: &dyn Fn(&DVector<f64>) -> Option<DVector<f64>>,
        base: &DVector<f64>,
        dim: usize,
    ) -> Option<DMatrix<f64>> {
        let mut jacobian = DMatrix::zeros(base.len(), dim);
        let mut x = DVector::zeros(dim);
        for j in 0..dim {
            x[j] = self.step;
            let shifted = residual(&x)?;
            jacobian.set_column(j, &((shifted - base) / self.step));
            x[j] = 0.0;
        }
        Some(jacobian)
    }
}

/// Symmetric finite differences; twice the evaluations, second-order accurate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CentralDifference {
    pub step: f64,
}

impl LaneJacobian for CentralDifference {
    fn jacobian(
        &self,
        residual: &dyn Fn(&DVector<f64>) -> Option<DVector<f64>>,
        base: &DVector<f64>,
        dim: usize,
    ) -> Option<DMatrix<f64>> {
        let mut jacobian = DMatrix::zeros(base.len(), dim);
        let mut x = DVector::zeros(dim);
        for j in 0..dim {
            x[j] = self.step;
            let ahead = residual(&x)?;
            x[j] = -self.step;
            let behind = residual(&x)?;
            jacobian.set_column(j, &((ahead - behind) / (2.0 * self.step)));
            x[j] = 0.0;
        }
        Some(jacobian)
    }
}

/// A state pose moved by the local `[δφ, δp]` columns.
pub(crate) fn perturbed_pose(state: &State, x: &DVector<f64>) -> (Rotation3<f64>, Vector3<f64>) {
    let d_rot = Vector3::new(x[0], x[1], x[2]);
    let d_pos = Vector3::new(x[3], x[4], x[5]);
    (
        state.rotation * exp_so3(&d_rot),
        state.position + state.rotation * d_pos,
    )
}

/// Start node of sub-segment `upto` with the chain moved by the local columns
/// following the pose; `count` sub-segments are perturbable.
pub(crate) fn perturbed_node(
    segment: &ArcSegment,
    x: &DVector<f64>,
    upto: usize,
    count: usize,
    min_curvature: f64,
) -> ArcPose {
    let base = POSE_DIM;
    let mut node = ArcPose::new(
        segment.anchor.x + x[base],
        segment.anchor.y + x[base + 1],
        segment.anchor.heading + x[base + 2],
    );
    for (t, sub) in segment.subsegments[..upto].iter().enumerate() {
        let curvature = clamp_curvature(sub.curvature + x[base + ANCHOR_DIM + t], min_curvature);
        let sqrt_length = sub.sqrt_length + x[base + ANCHOR_DIM + count + t];
        node = node.advance(curvature, sqrt_length * sqrt_length);
    }
    node
}

/// Places a local Jacobian `[pose | anchor κ₀.. | √L₀..]` into global blocks.
pub(crate) fn scatter(
    mut factor: FactorBlock,
    local: &DMatrix<f64>,
    state_index: usize,
    segment_index: usize,
    count: usize,
    layout: &Layout,
) -> Option<FactorBlock> {
    let rows = local.nrows();
    let state = layout.state(state_index);
    let segment = layout.segment(segment_index)?;
    factor = factor
        .with_block(state + ROT, local.view((0, 0), (rows, 3)).into_owned())
        .with_block(state + POS, local.view((0, 3), (rows, 3)).into_owned())
        .with_block(
            segment,
            local.view((0, POSE_DIM), (rows, ANCHOR_DIM + count)).into_owned(),
        );
    if count > 0 {
        factor = factor.with_block(
            layout.sqrt_length(segment_index, 0)?,
            local
                .view((0, POSE_DIM + ANCHOR_DIM + count), (rows, count))
                .into_owned(),
        );
    }
    Some(factor)
}

/// Lateral offset of the circle of curvature `curvature` centred at `center`
/// (world plane) at the look-ahead `longitudinal`, in the frame of a pose.
///
/// `None` when the look-ahead lies outside the circle.
pub fn lateral_on_arc(
    rotation: &Rotation3<f64>,
    position: &Vector3<f64>,
    center: &Vector2<f64>,
    curvature: f64,
    longitudinal: f64,
) -> Option<f64> {
    let (sin, cos) = heading(rotation).sin_cos();
    let offset = center - position.xy();
    let center_x = cos * offset.x + sin * offset.y;
    let center_y = -sin * offset.x + cos * offset.y;

    let radius = 1.0 / curvature;
    let discriminant = radius * radius - (longitudinal - center_x).powi(2);
    if discriminant < 0.0 {
        return None;
    }
    Some(center_y - curvature.signum() * discriminant.sqrt())
}

/// Lane measurement factors of one segment.
///
/// Returns the factors and the number of points skipped by the domain guard.
/// Points below the detection probability threshold are left out silently.
pub fn lane_blocks(
    segment_index: usize,
    segment: &ArcSegment,
    states: &[State],
    config: &LaneConfig,
    strategy: &dyn LaneJacobian,
    layout: &Layout,
) -> FusionResult<(Vec<FactorBlock>, usize)> {
    let owners = segment.owners();
    let mut factors = Vec::new();
    let mut skipped = 0;

    for (point, reference) in segment.points.iter().enumerate() {
        let resolved = resolve(segment_index, point, reference, states)?;
        if resolved.measurement.detection_probability < config.min_detection_probability {
            continue;
        }
        let sub = owners[point];
        let count = sub + 1;
        let state = resolved.state;
        let preview = resolved.preview;
        let sigma = level_lateral_std(&state.rotation, preview);

        let residual = |x: &DVector<f64>| -> Option<DVector<f64>> {
            let (rotation, position) = perturbed_pose(state, x);
            let start = perturbed_node(segment, x, sub, count, config.min_curvature);
            let curvature = clamp_curvature(
                segment.subsegments[sub].curvature + x[POSE_DIM + ANCHOR_DIM + sub],
                config.min_curvature,
            );
            let measured = level_offset(&rotation, preview);
            let lateral = lateral_on_arc(
                &rotation,
                &position,
                &start.center(curvature),
                curvature,
                measured.x,
            )?;
            Some(DVector::from_element(1, (measured.y - lateral) / sigma))
        };

        let dim = POSE_DIM + ANCHOR_DIM + 2 * count;
        let linearized = residual(&DVector::zeros(dim)).and_then(|base| {
            strategy
                .jacobian(&residual, &base, dim)
                .map(|jacobian| (base, jacobian))
        });
        let Some((base, jacobian)) = linearized else {
            skipped += 1;
            warn!(
                segment = segment_index,
                point,
                state = reference.state_index,
                "lane preview outside its arc, skipped"
            );
            continue;
        };

        if let Some(factor) = scatter(
            FactorBlock::new(base),
            &jacobian,
            reference.state_index,
            segment_index,
            count,
            layout,
        ) {
            factors.push(factor);
        }
    }
    Ok((factors, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FusionMode;
    use crate::layout::Capabilities;
    use crate::lane::SubSegment;
    use crate::messages::{LaneMeasurement, LanePointRef, LanePreview, LaneSide};
    use crate::types::LaneWindow;
    use approx::assert_relative_eq;

    const RADIUS: f64 = 100.0;

    /// A vehicle driving along a left-turning lane of radius 100 m whose
    /// boundary passes 2 m to its left.
    fn scene(detection_probability: f64, longitudinal: f64) -> (Vec<State>, ArcSegment) {
        let mut lanes = LaneWindow::default();
        lanes.insert(LaneMeasurement {
            state_index: 0,
            side: LaneSide::Left,
            previews: vec![LanePreview {
                longitudinal,
                lateral: 2.0,
                vertical: 0.0,
                lateral_std: 0.1,
                vertical_std: 0.1,
            }],
            detection_probability,
            reliability: 1.0,
        });
        let state = State {
            timestamp: 0.0,
            rotation: Rotation3::identity(),
            velocity: Vector3::new(10.0, 0.0, 0.0),
            position: Vector3::new(0.0, -2.0, 0.0),
            wheel_scale: None,
            lanes,
        };
        let segment = ArcSegment {
            side: LaneSide::Left,
            anchor: ArcPose::new(-20.0, 0.0, 0.0),
            subsegments: vec![
                SubSegment {
                    curvature: 1e-3,
                    sqrt_length: 20.0_f64.sqrt(),
                    bounds: (0, 0),
                    invalid_points: 0,
                },
                SubSegment {
                    curvature: 1.0 / RADIUS,
                    sqrt_length: 30.0_f64.sqrt(),
                    bounds: (1, 1),
                    invalid_points: 0,
                },
            ],
            points: vec![
                LanePointRef {
                    state_index: 0,
                    side: LaneSide::Left,
                    preview_index: 0,
                };
                2
            ],
        };
        (vec![state], segment)
    }

    #[test]
    fn lateral_on_a_straight_ahead_circle() {
        // Circle centred 100 m to the left of a pose at the origin.
        let lateral = lateral_on_arc(
            &Rotation3::identity(),
            &Vector3::zeros(),
            &Vector2::new(0.0, RADIUS),
            1.0 / RADIUS,
            10.0,
        )
        .unwrap();
        assert_relative_eq!(lateral, RADIUS - (RADIUS * RADIUS - 100.0).sqrt(), epsilon = 1e-12);
        assert!(lateral_on_arc(
            &Rotation3::identity(),
            &Vector3::zeros(),
            &Vector2::new(0.0, RADIUS),
            1.0 / RADIUS,
            250.0,
        )
        .is_none());
    }

    #[test]
    fn forward_and_central_differences_agree() {
        let (states, segment) = scene(0.9, 5.0);
        let layout = Layout::new(1, Capabilities::for_mode(FusionMode::Full), &[segment.clone()]);
        let config = LaneConfig::default();
        let (forward, skipped) = lane_blocks(
            0,
            &segment,
            &states,
            &config,
            &ForwardDifference { step: 1e-6 },
            &layout,
        )
        .unwrap();
        let (central, _) = lane_blocks(
            0,
            &segment,
            &states,
            &config,
            &CentralDifference { step: 1e-5 },
            &layout,
        )
        .unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(forward.len(), 2);
        for (f, c) in forward.iter().zip(&central) {
            assert_relative_eq!(f.residual, c.residual);
            for (fb, cb) in f.blocks.iter().zip(&c.blocks) {
                assert_eq!(fb.column, cb.column);
                assert_relative_eq!(fb.values, cb.values, epsilon = 1e-3, max_relative = 1e-4);
            }
        }
        // The second point depends on both sub-segments.
        assert_eq!(forward[1].blocks[2].values.ncols(), ANCHOR_DIM + 2);
        assert_eq!(forward[1].blocks[3].column, layout.sqrt_length(0, 0).unwrap());
    }

    #[test]
    fn lateral_position_gradient_is_one_over_sigma() {
        // Shifting the body along its own y axis moves the measured boundary by
        // the same amount, up to arc curvature at 5 m look-ahead.
        let (states, segment) = scene(0.9, 5.0);
        let layout = Layout::new(1, Capabilities::for_mode(FusionMode::Full), &[segment.clone()]);
        let (factors, _) = lane_blocks(
            0,
            &segment,
            &states,
            &LaneConfig::default(),
            &ForwardDifference { step: 1e-6 },
            &layout,
        )
        .unwrap();
        let d_lateral = factors[0].blocks[1].values[(0, 1)];
        assert_relative_eq!(d_lateral, 1.0 / 0.1, max_relative = 1e-3);
    }

    #[test]
    fn rolled_pose_measures_the_same_boundary() {
        let (level_states, segment) = scene(0.9, 5.0);
        let layout = Layout::new(1, Capabilities::for_mode(FusionMode::Full), &[segment.clone()]);
        let config = LaneConfig::default();
        let strategy = ForwardDifference { step: 1e-6 };

        // Rolled about the forward axis, the boundary 2 m to the left shows up
        // partly in the vertical offset.
        let roll: f64 = 0.2;
        let vertical = -1.0;
        let mut rolled_states = level_states.clone();
        let rolled = &mut rolled_states[0];
        rolled.rotation = Rotation3::from_axis_angle(&Vector3::x_axis(), roll);
        rolled.lanes.insert(LaneMeasurement {
            state_index: 0,
            side: LaneSide::Left,
            previews: vec![LanePreview {
                longitudinal: 5.0,
                lateral: (2.0 + vertical * roll.sin()) / roll.cos(),
                vertical,
                lateral_std: 0.1,
                vertical_std: 0.1,
            }],
            detection_probability: 0.9,
            reliability: 1.0,
        });

        let (level, _) = lane_blocks(0, &segment, &level_states, &config, &strategy, &layout).unwrap();
        let (tilted, _) = lane_blocks(0, &segment, &rolled_states, &config, &strategy, &layout).unwrap();
        for (l, t) in level.iter().zip(&tilted) {
            assert_relative_eq!(l.residual, t.residual, epsilon = 1e-9);
        }
    }

    #[test]
    fn low_detection_probability_is_not_fused() {
        let (states, segment) = scene(0.2, 5.0);
        let layout = Layout::new(1, Capabilities::for_mode(FusionMode::Full), &[segment.clone()]);
        let (factors, skipped) = lane_blocks(
            0,
            &segment,
            &states,
            &LaneConfig::default(),
            &ForwardDifference { step: 1e-6 },
            &layout,
        )
        .unwrap();
        assert!(factors.is_empty());
        assert_eq!(skipped, 0);
    }

    #[test]
    fn look_ahead_beyond_the_arc_is_skipped() {
        let (states, segment) = scene(0.9, 500.0);
        let layout = Layout::new(1, Capabilities::for_mode(FusionMode::Full), &[segment.clone()]);
        let (factors, skipped) = lane_blocks(
            0,
            &segment,
            &states,
            &LaneConfig::default(),
            &ForwardDifference { step: 1e-6 },
            &layout,
        )
        .unwrap();
        // Point 0 sits on the near-straight arc of radius 1 km, point 1 on the 100 m one.
        assert_eq!(factors.len(), 1);
        assert_eq!(skipped, 1);
    }
}
