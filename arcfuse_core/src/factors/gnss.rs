// arcfuse_core/src/factors/gnss.rs

use nalgebra::{DVector, Vector3};

use super::{dense, FactorBlock};
use crate::frames::LocalFrame;
use crate::layout::{Layout, POS};
use crate::messages::GnssFix;
use crate::types::State;

/// A GNSS fix converted into the local world frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GnssTarget {
    pub state_index: usize,
    pub position: Vector3<f64>,
    pub horizontal_accuracy: f64,
    pub vertical_accuracy: f64,
}

impl GnssTarget {
    pub fn from_fix(fix: &GnssFix, frame: &LocalFrame) -> Self {
        Self {
            state_index: fix.state_index,
            position: frame.to_enu(&fix.position),
            horizontal_accuracy: fix.horizontal_accuracy,
            vertical_accuracy: fix.vertical_accuracy,
        }
    }
}

/// Position residual `p − p_enu` with covariance `diag(h², h², v²)`.
pub fn gnss_block(target: &GnssTarget, state: &State, layout: &Layout) -> FactorBlock {
    let residual = state.position - target.position;
    let h = target.horizontal_accuracy;
    let v = target.vertical_accuracy;
    FactorBlock::new(DVector::from_column_slice(residual.as_slice()))
        .with_block(
            layout.state(target.state_index) + POS,
            dense(state.rotation.matrix()),
        )
        .scaled(&[h, h, v])
}
