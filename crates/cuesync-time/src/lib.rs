//! CUESYNC Time - Clock Sync Engine
//!
//! This crate implements clock synchronization against the time authority:
//! - Local clock sources (monotonic and manually driven)
//! - Four-timestamp round-trip probe samples
//! - Windowed, outlier-rejecting per-node offset estimation with drift
//! - Clock-step detection and rejection-rate based suspicion
//! - Epoch-scoped estimates that reset on authority change

pub mod clock;
pub mod engine;
pub mod estimator;
pub mod sample;

pub use clock::*;
pub use engine::*;
pub use estimator::*;
pub use sample::*;
