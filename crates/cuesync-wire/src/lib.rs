//! CUESYNC Wire Protocol - Binary message format
//!
//! This crate implements the wire format for CUESYNC messages:
//! - Fixed header (12 bytes: magic, version, kind, source node)
//! - Message bodies for discovery, heartbeats, clock probes and cue delivery
//! - Frame size limit of 1400 bytes

pub mod frame;
pub mod header;
pub mod message;

pub use frame::*;
pub use header::*;
pub use message::*;
