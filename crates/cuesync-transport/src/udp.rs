//! UDP transport implementation

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use cuesync_core::{LocalTime, NodeId, TransportError, TransportResult};
use cuesync_time::LocalClock;
use cuesync_wire::{Header, MAX_FRAME_SIZE};

use crate::{IncomingReceiver, Transport, INCOMING_CHANNEL_CAPACITY};

/// Node id to socket address mapping
pub type AddressBook = Arc<RwLock<HashMap<NodeId, SocketAddr>>>;

/// UDP transport for CUESYNC
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    clock: Arc<dyn LocalClock>,
    addresses: AddressBook,
    incoming: Mutex<Option<IncomingReceiver>>,
}

impl UdpTransport {
    /// Bind to a local address and start receiving.
    /// Must be called inside a tokio runtime.
    pub async fn bind(addr: SocketAddr, clock: Arc<dyn LocalClock>) -> TransportResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let addresses: AddressBook = Arc::new(RwLock::new(HashMap::new()));
        let incoming = start_receive_loop(
            Arc::clone(&socket),
            Arc::clone(&addresses),
            INCOMING_CHANNEL_CAPACITY,
        );

        tracing::info!(addr = %local_addr, "UDP transport bound");

        Ok(UdpTransport {
            socket,
            local_addr,
            clock,
            addresses,
            incoming: Mutex::new(Some(incoming)),
        })
    }

    /// Get local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Set the address of a node
    pub fn add_peer(&self, node: NodeId, addr: SocketAddr) {
        self.addresses.write().insert(node, addr);
    }

    pub fn peer_addr(&self, node: NodeId) -> Option<SocketAddr> {
        self.addresses.read().get(&node).copied()
    }
}

impl Transport for UdpTransport {
    fn send(&self, node: NodeId, bytes: Bytes, deadline: LocalTime) -> TransportResult<()> {
        if self.clock.now() > deadline {
            return Err(TransportError::DeadlineExceeded);
        }
        let addr = self.peer_addr(node).ok_or(TransportError::UnknownNode(node))?;
        let sent = self.socket.try_send_to(&bytes, addr)?;
        if sent != bytes.len() {
            return Err(TransportError::Io(format!(
                "short send: {} of {} bytes",
                sent,
                bytes.len()
            )));
        }
        Ok(())
    }

    fn subscribe_incoming(&self) -> TransportResult<IncomingReceiver> {
        self.incoming.lock().take().ok_or(TransportError::Closed)
    }
}

/// Start a background receive loop.
///
/// Datagrams without a valid header are dropped. The sender's address is
/// recorded in `addresses` under the source node id of the header.
pub fn start_receive_loop(
    socket: Arc<UdpSocket>,
    addresses: AddressBook,
    buffer_size: usize,
) -> IncomingReceiver {
    let (tx, rx) = mpsc::channel(buffer_size);

    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, addr)) => {
                    let header = match Header::parse(&buf[..len]) {
                        Ok(header) => header,
                        Err(e) => {
                            tracing::debug!(from = %addr, error = %e, "dropping malformed datagram");
                            continue;
                        }
                    };

                    let known = addresses.read().get(&header.source).copied();
                    if known != Some(addr) {
                        tracing::debug!(node = %header.source, addr = %addr, "learned node address");
                        addresses.write().insert(header.source, addr);
                    }

                    let packet = Bytes::copy_from_slice(&buf[..len]);
                    if tx.send((header.source, packet)).await.is_err() {
                        break; // Receiver dropped
                    }
                }
                Err(e) => {
                    tracing::warn!("UDP receive error: {}", e);
                }
            }
        }
    });

    rx
}
