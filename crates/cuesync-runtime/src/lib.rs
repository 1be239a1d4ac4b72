//! CUESYNC Runtime - the conductor process
//!
//! This crate wires the CUESYNC components into one runtime:
//! - `Conductor`: async loop over dispatch ticks, probe rounds,
//!   liveness evaluation and incoming frames
//! - `ConductorConfig`: TOML configuration for every component
//! - `telemetry`: tracing subscriber setup

pub mod conductor;
pub mod config;
pub mod error;
pub mod telemetry;

pub use conductor::*;
pub use config::*;
pub use error::*;
