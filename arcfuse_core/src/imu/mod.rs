// arcfuse_core/src/imu/mod.rs

//! Inertial pre-integration.

pub mod preintegration;

pub use preintegration::{ImuCluster, ImuNoise, Matrix9};
