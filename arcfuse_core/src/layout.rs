// arcfuse_core/src/layout.rs

//! The layout of the flat optimization vector.
//!
//! ```text
//! [ states: 9·N (δφ, δv, δp) | biases: 6·N (δbg, δba) | WSF: N | segments ]
//! ```
//!
//! Each segment block is `[δx, δy, δψ, δκ₁..δκₘ, δ√L₁..δ√Lₘ]`. Segment offsets
//! are kept in a running tracker rebuilt whenever a segment gains sub-segments.

use crate::config::FusionMode;
use crate::lane::ArcSegment;

/// Width of one state block.
pub const STATE_DIM: usize = 9;
/// Width of one bias block.
pub const BIAS_DIM: usize = 6;
/// Width of a segment's anchor pose block.
pub const ANCHOR_DIM: usize = 3;

/// Offsets inside a state block.
pub const ROT: usize = 0;
pub const VEL: usize = 3;
pub const POS: usize = 6;
/// Offsets inside a bias block.
pub const GYRO: usize = 0;
pub const ACCEL: usize = 3;

/// How the lane anchors are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorPolicy {
    /// First and last data point of each segment.
    Endpoints,
    /// Endpoints plus every internal sub-segment boundary.
    AllBoundaries,
}

/// Which factor builders and variables take part in a run.
///
/// Computed once from the [`FusionMode`]; builders never branch on the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub prior: bool,
    pub inertial: bool,
    pub gnss: bool,
    pub wheel: bool,
    pub wheel_scale: bool,
    pub lane: bool,
    pub anchors: AnchorPolicy,
}

impl Capabilities {
    pub fn for_mode(mode: FusionMode) -> Self {
        let base = Self {
            prior: true,
            inertial: true,
            gnss: true,
            wheel: false,
            wheel_scale: false,
            lane: false,
            anchors: AnchorPolicy::Endpoints,
        };
        match mode {
            FusionMode::Basic => base,
            FusionMode::Partial => Self {
                wheel: true,
                wheel_scale: true,
                ..base
            },
            FusionMode::Full => Self {
                wheel: true,
                wheel_scale: true,
                lane: true,
                ..base
            },
            FusionMode::TwoPhase => Self {
                wheel: true,
                wheel_scale: true,
                lane: true,
                anchors: AnchorPolicy::AllBoundaries,
                ..base
            },
        }
    }

    /// The capability set of the fine phase that follows a coarse one.
    pub fn refined(self) -> Self {
        Self {
            anchors: AnchorPolicy::Endpoints,
            ..self
        }
    }
}

/// Offsets of every variable block in the optimization vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    num_states: usize,
    capabilities: Capabilities,
    /// Per-segment running index into the vector.
    tracker: Vec<usize>,
    /// Sub-segment count each tracker entry was computed for.
    subsegment_counts: Vec<usize>,
    dim: usize,
}

impl Layout {
    pub fn new(num_states: usize, capabilities: Capabilities, segments: &[ArcSegment]) -> Self {
        let mut offset = num_states * (STATE_DIM + BIAS_DIM);
        if capabilities.wheel_scale {
            offset += num_states;
        }

        let mut tracker = Vec::new();
        let mut subsegment_counts = Vec::new();
        if capabilities.lane {
            for segment in segments {
                tracker.push(offset);
                subsegment_counts.push(segment.len());
                offset += segment_block_dim(segment.len());
            }
        }

        Self {
            num_states,
            capabilities,
            tracker,
            subsegment_counts,
            dim: offset,
        }
    }

    /// Total length of the optimization vector.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn state(&self, index: usize) -> usize {
        index * STATE_DIM
    }

    pub fn bias(&self, index: usize) -> usize {
        self.num_states * STATE_DIM + index * BIAS_DIM
    }

    /// Offset of a state's wheel-scale factor, when estimated.
    pub fn wheel_scale(&self, index: usize) -> Option<usize> {
        self.capabilities
            .wheel_scale
            .then(|| self.num_states * (STATE_DIM + BIAS_DIM) + index)
    }

    /// Offset of a segment's block, when the lane model is active.
    pub fn segment(&self, index: usize) -> Option<usize> {
        self.tracker.get(index).copied()
    }

    pub fn num_segments(&self) -> usize {
        self.tracker.len()
    }

    /// Offset of the curvature of sub-segment `sub` of segment `index`.
    pub fn curvature(&self, index: usize, sub: usize) -> Option<usize> {
        self.segment(index).map(|offset| offset + ANCHOR_DIM + sub)
    }

    /// Offset of the square-root length of sub-segment `sub` of segment `index`.
    pub fn sqrt_length(&self, index: usize, sub: usize) -> Option<usize> {
        let count = *self.subsegment_counts.get(index)?;
        self.segment(index)
            .map(|offset| offset + ANCHOR_DIM + count + sub)
    }

    /// Whether the tracker still matches the segments' sub-segment counts.
    pub fn matches(&self, segments: &[ArcSegment]) -> bool {
        !self.capabilities.lane
            || (segments.len() == self.subsegment_counts.len()
                && segments
                    .iter()
                    .zip(&self.subsegment_counts)
                    .all(|(s, &n)| s.len() == n))
    }
}

/// Width of the block of a segment with `subsegments` sub-segments.
pub fn segment_block_dim(subsegments: usize) -> usize {
    ANCHOR_DIM + 2 * subsegments
}
