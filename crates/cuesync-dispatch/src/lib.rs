//! CUESYNC Dispatch
//!
//! Turns cues into per-node deliveries:
//! - Cue Scheduler: resolves targets, computes send and execution times
//! - Dispatch Coordinator: sends on time, tracks acknowledgments and misses
//! - Dispatch table: live cues, their dispatch records and idempotency keys

pub mod coordinator;
pub mod scheduler;
pub mod table;

#[cfg(test)]
mod testing;

pub use coordinator::*;
pub use scheduler::*;
pub use table::*;
