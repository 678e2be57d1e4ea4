// arcfuse_sim/src/sensors/mod.rs

//! Noisy sensor synthesizers driven by the ground-truth trajectory.
//!
//! Every synthesizer draws from the scenario's single `ChaCha8Rng`, so a seed
//! fully determines the generated data.

pub mod gnss;
pub mod imu;
pub mod lane;
pub mod wheel;

pub use gnss::GnssSynthesizer;
pub use imu::ImuSynthesizer;
pub use lane::LaneSynthesizer;
pub use wheel::WheelSynthesizer;
