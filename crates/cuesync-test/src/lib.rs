//! CUESYNC Test Harness - simulation and end-to-end scenarios
//!
//! This crate provides:
//! - Seeded link models with latency, jitter, loss and duplication
//! - Node clock models with offset and drift
//! - A step simulator running a real conductor against simulated nodes
//! - End-to-end scenario tests

pub mod clock;
pub mod link;
pub mod simulator;

#[cfg(test)]
mod scenarios;

pub use clock::*;
pub use link::*;
pub use simulator::*;
