//! CUESYNC Core - Fundamental types and primitives
//!
//! This crate defines the types shared by every CUESYNC component:
//! - Identifiers (NodeId, CueId, Epoch, Authority)
//! - Time bases (LocalTime, AuthorityTime, NodeTime) and clock offsets
//! - Capability descriptors and cue kinds
//! - Cue definitions, dispatch status and liveness states
//! - Status events and the event bus
//! - Error taxonomy

pub mod capability;
pub mod cue;
pub mod error;
pub mod estimate;
pub mod event;
pub mod id;
pub mod liveness;
pub mod time;

pub use capability::*;
pub use cue::*;
pub use error::*;
pub use estimate::*;
pub use event::*;
pub use id::*;
pub use liveness::*;
pub use time::*;
