// arcfuse_core/src/prelude.rs

// --- Entry points ---
pub use crate::estimation::{Estimator, FusionSolution, SolverReport, Termination};

// --- Configuration and errors ---
pub use crate::config::{FusionConfig, FusionMode, LaneConfig, NoiseConfig, SolverConfig, SolverKind};
pub use crate::error::{FusionError, FusionResult, SingularityReport};

// --- Inputs (the "messages" the estimator consumes) ---
pub use crate::frames::{GeodeticPoint, LocalFrame};
pub use crate::messages::{
    BiasEstimate, FusionInputs, GnssFix, ImuInterval, ImuSample, InitialPose, LaneMeasurement,
    LanePointRef, LanePreview, LaneSide, SegmentSeed, WheelSpeedSample,
};

// --- Estimated values ---
pub use crate::lane::{ArcPose, ArcSegment, SubSegment};
pub use crate::types::{Bias, State};

// --- Extension points ---
pub use crate::estimation::Solver;
pub use crate::factors::{CentralDifference, ForwardDifference, LaneJacobian};
