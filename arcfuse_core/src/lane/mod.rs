// arcfuse_core/src/lane/mod.rs

//! The arc-spline lane model and its adaptive fitter.

pub mod association;
pub mod fitter;
pub mod segment;

pub use association::{
    level_lateral_std, level_offset, locate_points, planar_point, resolve, LanePoint, ResolvedPoint,
};
pub use fitter::{ArcFitter, FitReport, Validation};
pub use segment::{clamp_curvature, ArcPose, ArcSegment, SubSegment};
