// arcfuse_sim/src/lib.rs

// Synthetic scenarios for exercising the fusion core end to end.
pub mod prelude;

pub mod config;
pub mod error;
pub mod scenario;
pub mod sensors;
pub mod trajectory;
