// arcfuse_core/src/lib.rs

// This file defines the public modules of the library.
pub mod config;
pub mod error;
pub mod estimation;
pub mod factors;
pub mod frames;
pub mod imu;
pub mod lane;
pub mod layout;
pub mod manifold;
pub mod messages;
pub mod prelude;
pub mod retraction;
pub mod types;
