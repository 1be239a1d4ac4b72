//! CUESYNC Peer Layer
//!
//! Who takes part in a show, and whose clock is the reference.
//!
//! - Peer Registry: connected nodes, capability descriptors, liveness
//! - Time Authority Arbitration: lowest eligible active node, local fallback
//!
//! # Liveness
//!
//! ```text
//! Active --(missed heartbeats)--> Suspect --(grace expired)--> Departed
//!    ^                               |
//!    +---------(heartbeat)-----------+
//! ```
//!
//! Departed is terminal. The same id registering again starts over with no
//! clock data.

pub mod authority;
pub mod registry;

pub use authority::*;
pub use registry::*;
