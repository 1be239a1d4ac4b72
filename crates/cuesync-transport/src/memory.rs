//! In-memory transport
//!
//! A `MemoryNetwork` connects any number of `MemoryTransport` endpoints.
//! Frames are delivered instantly into the destination's channel. Links can
//! be cut to inject delivery failures.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use cuesync_core::{LocalTime, NodeId, TransportError, TransportResult};
use cuesync_time::LocalClock;

use crate::{Incoming, IncomingReceiver, Transport, INCOMING_CHANNEL_CAPACITY};

/// Shared in-memory network
pub struct MemoryNetwork {
    clock: Arc<dyn LocalClock>,
    endpoints: RwLock<HashMap<NodeId, mpsc::Sender<Incoming>>>,
    down: RwLock<HashSet<NodeId>>,
    capacity: usize,
}

impl MemoryNetwork {
    pub fn new(clock: Arc<dyn LocalClock>) -> Arc<Self> {
        Self::with_capacity(clock, INCOMING_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(clock: Arc<dyn LocalClock>, capacity: usize) -> Arc<Self> {
        Arc::new(MemoryNetwork {
            clock,
            endpoints: RwLock::new(HashMap::new()),
            down: RwLock::new(HashSet::new()),
            capacity,
        })
    }

    /// Attach an endpoint for `node`, replacing any previous one
    pub fn endpoint(self: &Arc<Self>, node: NodeId) -> MemoryTransport {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.endpoints.write().insert(node, tx);
        MemoryTransport {
            id: node,
            network: Arc::clone(self),
            incoming: Mutex::new(Some(rx)),
        }
    }

    /// Cut or restore the link to `node`; sends fail with an I/O error while down
    pub fn set_link_down(&self, node: NodeId, down: bool) {
        let mut links = self.down.write();
        if down {
            links.insert(node);
        } else {
            links.remove(&node);
        }
    }

    fn deliver(&self, from: NodeId, to: NodeId, bytes: Bytes, deadline: LocalTime) -> TransportResult<()> {
        if self.clock.now() > deadline {
            return Err(TransportError::DeadlineExceeded);
        }
        if self.down.read().contains(&to) {
            return Err(TransportError::Io(format!("link to {} is down", to)));
        }
        let sender = self
            .endpoints
            .read()
            .get(&to)
            .cloned()
            .ok_or(TransportError::UnknownNode(to))?;

        sender.try_send((from, bytes)).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::WouldBlock,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

/// One endpoint of a `MemoryNetwork`
pub struct MemoryTransport {
    id: NodeId,
    network: Arc<MemoryNetwork>,
    incoming: Mutex<Option<IncomingReceiver>>,
}

impl MemoryTransport {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

impl Transport for MemoryTransport {
    fn send(&self, node: NodeId, bytes: Bytes, deadline: LocalTime) -> TransportResult<()> {
        self.network.deliver(self.id, node, bytes, deadline)
    }

    fn subscribe_incoming(&self) -> TransportResult<IncomingReceiver> {
        self.incoming.lock().take().ok_or(TransportError::Closed)
    }
}
