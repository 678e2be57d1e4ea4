// arcfuse_core/src/factors/anchor.rs

//! Pins arc nodes to the data points they start from, tying each segment to
//! the vehicle trajectory.

use nalgebra::DVector;

use super::lane::{perturbed_node, perturbed_pose, scatter, LaneJacobian, POSE_DIM};
use super::FactorBlock;
use crate::config::LaneConfig;
use crate::error::{FusionError, FusionResult};
use crate::lane::{planar_point, resolve, ArcSegment};
use crate::layout::{AnchorPolicy, Layout, ANCHOR_DIM};
use crate::types::State;

/// `(node, point)` pairs pinned under a policy.
///
/// Node `t < m` goes to the first point of sub-segment `t`; the closing node
/// goes to the last point of the segment.
pub fn anchor_pairs(segment: &ArcSegment, policy: AnchorPolicy) -> Vec<(usize, usize)> {
    let m = segment.len();
    let Some(last) = segment.subsegments.last() else {
        return Vec::new();
    };
    let mut pairs = match policy {
        AnchorPolicy::Endpoints => vec![(0, segment.subsegments[0].bounds.0)],
        AnchorPolicy::AllBoundaries => segment
            .subsegments
            .iter()
            .enumerate()
            .map(|(t, sub)| (t, sub.bounds.0))
            .collect(),
    };
    pairs.push((m, last.bounds.1));
    pairs
}

/// Anchor factors of one segment: node position against the located point.
pub fn anchor_blocks(
    segment_index: usize,
    segment: &ArcSegment,
    states: &[State],
    policy: AnchorPolicy,
    config: &LaneConfig,
    strategy: &dyn LaneJacobian,
    layout: &Layout,
) -> FusionResult<Vec<FactorBlock>> {
    let mut factors = Vec::new();
    for (node, point) in anchor_pairs(segment, policy) {
        let reference = &segment.points[point];
        let resolved = resolve(segment_index, point, reference, states)?;
        let state = resolved.state;
        let preview = resolved.preview;

        let residual = |x: &DVector<f64>| -> Option<DVector<f64>> {
            let (rotation, position) = perturbed_pose(state, x);
            let located = planar_point(&rotation, &position, preview);
            let pinned = perturbed_node(segment, x, node, node, config.min_curvature);
            Some(DVector::from_column_slice(
                ((pinned.position() - located) / config.anchor_std).as_slice(),
            ))
        };

        let dim = POSE_DIM + ANCHOR_DIM + 2 * node;
        let (base, jacobian) = residual(&DVector::zeros(dim))
            .and_then(|base| {
                strategy
                    .jacobian(&residual, &base, dim)
                    .map(|jacobian| (base, jacobian))
            })
            .ok_or(FusionError::AnchorNotLinearizable {
                segment: segment_index,
                node,
            })?;
        if let Some(factor) = scatter(
            FactorBlock::new(base),
            &jacobian,
            reference.state_index,
            segment_index,
            node,
            layout,
        ) {
            factors.push(factor);
        }
    }
    Ok(factors)
}
