// arcfuse_core/src/lane/association.rs

//! Ties segment data points to the preview measurements they came from.

use nalgebra::{Rotation3, Vector2, Vector3};

use crate::error::{FusionError, FusionResult};
use crate::manifold::heading;
use crate::messages::{LaneMeasurement, LanePointRef, LanePreview};
use crate::types::State;

/// A data point placed in the world plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LanePoint {
    pub position: Vector2<f64>,
    /// Level-frame lateral 1-sigma of the underlying preview (m).
    pub sigma: f64,
}

/// A data point resolved against the state window it was recorded in.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedPoint<'a> {
    pub state: &'a State,
    pub measurement: &'a LaneMeasurement,
    pub preview: &'a LanePreview,
}

/// Finds the preview candidate behind one data point.
///
/// # Errors
/// `LanePointUnmatched` when the state, its lane window for that side or the
/// preview index does not exist.
pub fn resolve<'a>(
    segment: usize,
    point: usize,
    reference: &LanePointRef,
    states: &'a [State],
) -> FusionResult<ResolvedPoint<'a>> {
    let unmatched = || FusionError::LanePointUnmatched { segment, point };
    let state = states.get(reference.state_index).ok_or_else(unmatched)?;
    let measurement = state.lanes.side(reference.side).ok_or_else(unmatched)?;
    let preview = measurement
        .previews
        .get(reference.preview_index)
        .ok_or_else(unmatched)?;
    Ok(ResolvedPoint {
        state,
        measurement,
        preview,
    })
}

/// Roll and pitch of a pose: body → heading-aligned level frame.
fn tilt(rotation: &Rotation3<f64>) -> Rotation3<f64> {
    Rotation3::from_axis_angle(&Vector3::z_axis(), -heading(rotation)) * rotation
}

/// Preview offset in the level frame of a pose (x forward, y left).
///
/// Roll and pitch carry the vertical offset into the plane of the lane model.
pub fn level_offset(rotation: &Rotation3<f64>, preview: &LanePreview) -> Vector2<f64> {
    (tilt(rotation) * preview.offset()).xy()
}

/// 1-sigma of the level-frame lateral offset, mixing in the vertical std as
/// far as the pose is tilted.
pub fn level_lateral_std(rotation: &Rotation3<f64>, preview: &LanePreview) -> f64 {
    let tilt = tilt(rotation);
    let m = tilt.matrix();
    (m[(1, 1)] * preview.lateral_std).hypot(m[(1, 2)] * preview.vertical_std)
}

/// World-plane position of a preview seen from a pose.
pub fn planar_point(rotation: &Rotation3<f64>, position: &Vector3<f64>, preview: &LanePreview) -> Vector2<f64> {
    (position + rotation * preview.offset()).xy()
}

/// Places every data point of a segment in the world plane using the current
/// state poses.
pub fn locate_points(
    segment: usize,
    references: &[LanePointRef],
    states: &[State],
) -> FusionResult<Vec<LanePoint>> {
    references
        .iter()
        .enumerate()
        .map(|(point, reference)| {
            let resolved = resolve(segment, point, reference, states)?;
            let state = resolved.state;
            Ok(LanePoint {
                position: planar_point(&state.rotation, &state.position, resolved.preview),
                sigma: level_lateral_std(&state.rotation, resolved.preview),
            })
        })
        .collect()
}

/// Just the positions of a point list.
pub fn positions(points: &[LanePoint]) -> Vec<Vector2<f64>> {
    points.iter().map(|p| p.position).collect()
}
