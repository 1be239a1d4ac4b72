//! CUESYNC Transport Layer
//!
//! This crate provides:
//! - The `Transport` seam consumed by the dispatch and clock components
//! - UDP transport with a node address book
//! - In-memory transport for tests and simulation

pub mod memory;
pub mod udp;

use bytes::Bytes;
use tokio::sync::mpsc;

use cuesync_core::{LocalTime, NodeId, TransportResult};

pub use memory::*;
pub use udp::*;

/// Default capacity of the incoming message channel
pub const INCOMING_CHANNEL_CAPACITY: usize = 1024;

/// Received frame with the node it came from
pub type Incoming = (NodeId, Bytes);

/// Incoming message channel
pub type IncomingReceiver = mpsc::Receiver<Incoming>;

/// Message transport to nodes.
///
/// `send` never blocks: it either hands the frame to the network or fails.
/// `deadline` is the local instant after which delivery is useless.
pub trait Transport: Send + Sync {
    fn send(&self, node: NodeId, bytes: Bytes, deadline: LocalTime) -> TransportResult<()>;

    /// Take the incoming message stream. There is a single consumer;
    /// later calls fail with `TransportError::Closed`.
    fn subscribe_incoming(&self) -> TransportResult<IncomingReceiver>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send(&self, node: NodeId, bytes: Bytes, deadline: LocalTime) -> TransportResult<()> {
        (**self).send(node, bytes, deadline)
    }

    fn subscribe_incoming(&self) -> TransportResult<IncomingReceiver> {
        (**self).subscribe_incoming()
    }
}
