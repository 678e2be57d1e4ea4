// arcfuse_core/src/lane/segment.rs

//! Piecewise-arc lane boundary geometry.
//!
//! A segment is an anchor pose followed by a chain of circular arcs. Node `t`
//! is where sub-segment `t` starts; node `m` closes the chain.

use nalgebra::{DVector, Vector2};

use crate::error::{FusionError, FusionResult};
use crate::layout::ANCHOR_DIM;
use crate::messages::{LanePointRef, LaneSide, SegmentSeed};

/// Lengths are never allowed to collapse below this when recomputed (m).
const MIN_LENGTH: f64 = 1e-3;

/// A pose in the local horizontal plane.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ArcPose {
    pub x: f64,
    pub y: f64,
    /// Tangent direction (rad, from east, counter-clockwise).
    pub heading: f64,
}

impl ArcPose {
    pub fn new(x: f64, y: f64, heading: f64) -> Self {
        Self { x, y, heading }
    }

    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }

    /// Pose after travelling `length` along an arc of the given curvature.
    pub fn advance(&self, curvature: f64, length: f64) -> Self {
        let half_turn = 0.5 * curvature * length;
        // (sin ψ' − sin ψ)/κ written through sinc so it stays exact as κ → 0.
        let chord = length * sinc(half_turn);
        let mid_heading = self.heading + half_turn;
        Self {
            x: self.x + chord * mid_heading.cos(),
            y: self.y + chord * mid_heading.sin(),
            heading: self.heading + curvature * length,
        }
    }

    /// Centre of the circle of the given curvature tangent to this pose.
    pub fn center(&self, curvature: f64) -> Vector2<f64> {
        let radius = 1.0 / curvature;
        Vector2::new(
            self.x - self.heading.sin() * radius,
            self.y + self.heading.cos() * radius,
        )
    }
}

fn sinc(u: f64) -> f64 {
    if u.abs() < 1e-6 {
        1.0 - u * u / 6.0
    } else {
        u.sin() / u
    }
}

/// Keeps a curvature at or above `min_curvature` in magnitude, preserving its sign.
pub fn clamp_curvature(curvature: f64, min_curvature: f64) -> f64 {
    if curvature.abs() >= min_curvature {
        curvature
    } else if curvature < 0.0 {
        -min_curvature
    } else {
        min_curvature
    }
}

/// One arc of the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct SubSegment {
    pub curvature: f64,
    /// Square root of the arc length; the length itself is always its square.
    pub sqrt_length: f64,
    /// Inclusive range of the segment's data points owned by this arc.
    pub bounds: (usize, usize),
    /// Points found inconsistent by the last validation.
    pub invalid_points: usize,
}

impl SubSegment {
    pub fn length(&self) -> f64 {
        self.sqrt_length * self.sqrt_length
    }

    pub fn radius(&self) -> f64 {
        1.0 / self.curvature
    }

    pub fn point_count(&self) -> usize {
        self.bounds.1 + 1 - self.bounds.0
    }
}

/// A lane boundary modelled as a chain of arcs.
#[derive(Debug, Clone, PartialEq)]
pub struct ArcSegment {
    pub side: LaneSide,
    pub anchor: ArcPose,
    pub subsegments: Vec<SubSegment>,
    /// Data points of the segment, in travel order.
    pub points: Vec<LanePointRef>,
}

impl ArcSegment {
    /// Builds a segment from a seed partition.
    ///
    /// `positions` are the seed's points located in the world plane. The anchor
    /// is placed on the first point, heading towards the second.
    ///
    /// # Errors
    /// `SegmentSizeMismatch` when the seed arrays disagree in length or the
    /// bounds do not partition the points.
    pub fn from_seed(
        index: usize,
        seed: &SegmentSeed,
        positions: &[Vector2<f64>],
        min_curvature: f64,
    ) -> FusionResult<Self> {
        let count = seed.bounds.len();
        for actual in [seed.curvatures.len(), seed.lengths.len()] {
            if actual != count {
                return Err(FusionError::SegmentSizeMismatch {
                    segment: index,
                    expected: count,
                    actual,
                });
            }
        }
        if positions.len() != seed.points.len() {
            return Err(FusionError::SegmentSizeMismatch {
                segment: index,
                expected: seed.points.len(),
                actual: positions.len(),
            });
        }
        if count == 0 || seed.points.len() < 2 {
            return Err(FusionError::InvalidInput(format!(
                "segment {index} needs at least one sub-segment and two points"
            )));
        }
        check_partition(index, &seed.bounds, seed.points.len())?;

        let direction = positions[1] - positions[0];
        let anchor = ArcPose::new(
            positions[0].x,
            positions[0].y,
            direction.y.atan2(direction.x),
        );

        let subsegments = seed
            .bounds
            .iter()
            .zip(seed.curvatures.iter().zip(&seed.lengths))
            .map(|(&bounds, (&curvature, &length))| SubSegment {
                curvature: clamp_curvature(curvature, min_curvature),
                sqrt_length: length.max(0.0).sqrt(),
                bounds,
                invalid_points: 0,
            })
            .collect();

        let mut segment = Self {
            side: seed.side,
            anchor,
            subsegments,
            points: seed.points.clone(),
        };
        if segment.subsegments.iter().any(|s| s.length() < MIN_LENGTH) {
            segment.recompute_lengths(positions);
        }
        Ok(segment)
    }

    /// Number of sub-segments.
    pub fn len(&self) -> usize {
        self.subsegments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subsegments.is_empty()
    }

    /// The `m + 1` nodes of the chain.
    pub fn nodes(&self) -> Vec<ArcPose> {
        let mut nodes = Vec::with_capacity(self.len() + 1);
        let mut node = self.anchor;
        nodes.push(node);
        for sub in &self.subsegments {
            node = node.advance(sub.curvature, sub.length());
            nodes.push(node);
        }
        nodes
    }

    /// Circle centre of sub-segment `sub`.
    pub fn center(&self, sub: usize) -> Vector2<f64> {
        let start = self.subsegments[..sub]
            .iter()
            .fold(self.anchor, |node, s| node.advance(s.curvature, s.length()));
        start.center(self.subsegments[sub].curvature)
    }

    /// Signed distance of a point from the circle of sub-segment `sub`.
    pub fn distance(&self, sub: usize, point: &Vector2<f64>) -> f64 {
        (point - self.center(sub)).norm() - self.subsegments[sub].radius().abs()
    }

    /// Sub-segment index owning each data point.
    pub fn owners(&self) -> Vec<usize> {
        let mut owners = vec![0; self.points.len()];
        for (sub, s) in self.subsegments.iter().enumerate() {
            for owner in &mut owners[s.bounds.0..=s.bounds.1] {
                *owner = sub;
            }
        }
        owners
    }

    /// Flat parameters `[x, y, ψ, κ₁..κₘ, √L₁..√Lₘ]`, in optimization-vector order.
    pub fn parameters(&self) -> DVector<f64> {
        let m = self.len();
        let mut params = DVector::zeros(ANCHOR_DIM + 2 * m);
        params[0] = self.anchor.x;
        params[1] = self.anchor.y;
        params[2] = self.anchor.heading;
        for (t, sub) in self.subsegments.iter().enumerate() {
            params[ANCHOR_DIM + t] = sub.curvature;
            params[ANCHOR_DIM + m + t] = sub.sqrt_length;
        }
        params
    }

    /// Writes flat parameters back, clamping curvatures.
    pub fn set_parameters(&mut self, params: &DVector<f64>, min_curvature: f64) {
        let m = self.len();
        self.anchor = ArcPose::new(params[0], params[1], params[2]);
        for (t, sub) in self.subsegments.iter_mut().enumerate() {
            sub.curvature = clamp_curvature(params[ANCHOR_DIM + t], min_curvature);
            sub.sqrt_length = params[ANCHOR_DIM + m + t];
        }
    }

    /// Splits sub-segment `sub` at its middle point.
    ///
    /// Both halves inherit the curvature; every length is then recomputed from
    /// the point positions. Returns `false` when the sub-segment has fewer than
    /// `min_points` points.
    pub fn split(&mut self, sub: usize, positions: &[Vector2<f64>], min_points: usize) -> bool {
        let original = &self.subsegments[sub];
        let (first, last) = original.bounds;
        if original.point_count() < min_points.max(2) {
            return false;
        }
        let middle = first + (last - first) / 2;
        let curvature = original.curvature;

        self.subsegments[sub] = SubSegment {
            curvature,
            sqrt_length: 0.0,
            bounds: (first, middle),
            invalid_points: 0,
        };
        self.subsegments.insert(
            sub + 1,
            SubSegment {
                curvature,
                sqrt_length: 0.0,
                bounds: (middle + 1, last),
                invalid_points: 0,
            },
        );
        self.recompute_lengths(positions);
        true
    }

    /// Resets every length to the cumulative point-to-point distance from the
    /// sub-segment's first point to the next sub-segment's first point (the
    /// last one to its own last point).
    pub fn recompute_lengths(&mut self, positions: &[Vector2<f64>]) {
        let path = |from: usize, to: usize| -> f64 {
            positions[from..=to]
                .windows(2)
                .map(|w| (w[1] - w[0]).norm())
                .sum()
        };

        let starts: Vec<usize> = self.subsegments.iter().map(|s| s.bounds.0).collect();
        let m = self.len();
        for (t, sub) in self.subsegments.iter_mut().enumerate() {
            let end = if t + 1 < m { starts[t + 1] } else { sub.bounds.1 };
            sub.sqrt_length = path(sub.bounds.0, end).max(MIN_LENGTH).sqrt();
        }
    }
}

fn check_partition(index: usize, bounds: &[(usize, usize)], points: usize) -> FusionResult<()> {
    let mut next = 0;
    for &(first, last) in bounds {
        if first != next || last < first {
            return Err(FusionError::SegmentSizeMismatch {
                segment: index,
                expected: next,
                actual: first,
            });
        }
        next = last + 1;
    }
    if next != points {
        return Err(FusionError::SegmentSizeMismatch {
            segment: index,
            expected: points,
            actual: next,
        });
    }
    Ok(())
}
