//! Transport capability
//!
//! The node consumes exactly three things from the network: addressed
//! `send`, `broadcast` to connected peers, and a stream of inbound
//! [`TransportEvent`]s. Implementations must be thread-safe (Send + Sync).

use crate::messages::WireMessage;
use crate::peer::PeerId;
use async_trait::async_trait;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Peer not connected: {0}")]
    NotConnected(PeerId),
    #[error("Unknown address: {0}")]
    UnknownAddress(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Event from the transport layer
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// New peer connected
    PeerConnected { peer: PeerId, address: String },
    /// Peer disconnected
    PeerDisconnected(PeerId),
    /// Message received from a connected peer
    MessageReceived { from: PeerId, message: WireMessage },
}

/// Network transport consumed by the node.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Our peer id
    fn local_peer(&self) -> PeerId;

    /// Our listen address
    fn local_address(&self) -> String;

    /// Connect to a peer by address, returning its id.
    async fn connect(&self, address: &str) -> Result<PeerId, TransportError>;

    /// Send a message to a connected peer.
    async fn send(&self, peer: &PeerId, message: WireMessage) -> Result<(), TransportError>;

    /// Send to every connected peer, returning how many deliveries succeeded.
    async fn broadcast(&self, message: WireMessage) -> usize;

    /// Currently connected peers
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Check if connected to a peer
    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected_peers().contains(peer)
    }
}

/// In-memory transport for tests and single-process simulation.
///
/// Every endpoint gets an unbounded event channel, so a handler that sends
/// while processing an inbound message can never deadlock against a peer
/// doing the same.
pub mod memory {
    use super::*;
    use parking_lot::RwLock;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tracing::{debug, trace};

    struct Endpoint {
        address: String,
        tx: mpsc::UnboundedSender<TransportEvent>,
    }

    /// Shared state for the memory transport network.
    #[derive(Default)]
    pub struct MemoryNetwork {
        endpoints: RwLock<HashMap<PeerId, Endpoint>>,
        addresses: RwLock<HashMap<String, PeerId>>,
        /// Undirected links, stored as (min, max)
        links: RwLock<HashSet<(PeerId, PeerId)>>,
        /// Links that exist but silently drop traffic
        partitioned: RwLock<HashSet<(PeerId, PeerId)>>,
    }

    fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Register an endpoint and return its transport plus inbound event stream.
        pub fn join(
            self: &Arc<Self>,
            peer: PeerId,
            address: impl Into<String>,
        ) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
            let address = address.into();
            let (tx, rx) = mpsc::unbounded_channel();
            self.endpoints.write().insert(
                peer,
                Endpoint {
                    address: address.clone(),
                    tx,
                },
            );
            self.addresses.write().insert(address.clone(), peer);

            let transport = MemoryTransport {
                peer,
                address,
                network: Arc::clone(self),
            };
            (transport, rx)
        }

        /// Remove an endpoint, disconnecting all of its links.
        pub fn leave(&self, peer: &PeerId) {
            let neighbours = self.neighbours(peer);
            for other in neighbours {
                self.unlink(*peer, other);
            }
            if let Some(endpoint) = self.endpoints.write().remove(peer) {
                self.addresses.write().remove(&endpoint.address);
            }
        }

        /// Make traffic between two linked peers silently disappear.
        pub fn partition(&self, a: PeerId, b: PeerId) {
            self.partitioned.write().insert(link_key(a, b));
        }

        /// Undo [`MemoryNetwork::partition`].
        pub fn heal(&self, a: PeerId, b: PeerId) {
            self.partitioned.write().remove(&link_key(a, b));
        }

        fn neighbours(&self, peer: &PeerId) -> Vec<PeerId> {
            self.links
                .read()
                .iter()
                .filter_map(|(a, b)| {
                    if a == peer {
                        Some(*b)
                    } else if b == peer {
                        Some(*a)
                    } else {
                        None
                    }
                })
                .collect()
        }

        fn emit(&self, to: &PeerId, event: TransportEvent) -> bool {
            match self.endpoints.read().get(to) {
                Some(endpoint) => endpoint.tx.send(event).is_ok(),
                None => false,
            }
        }

        fn link(&self, a: PeerId, b: PeerId) -> Result<(), TransportError> {
            let (addr_a, addr_b) = {
                let endpoints = self.endpoints.read();
                let addr_a = endpoints
                    .get(&a)
                    .map(|e| e.address.clone())
                    .ok_or(TransportError::ConnectionClosed)?;
                let addr_b = endpoints
                    .get(&b)
                    .map(|e| e.address.clone())
                    .ok_or(TransportError::NotConnected(b))?;
                (addr_a, addr_b)
            };

            if !self.links.write().insert(link_key(a, b)) {
                return Ok(());
            }
            self.emit(&a, TransportEvent::PeerConnected { peer: b, address: addr_b });
            self.emit(&b, TransportEvent::PeerConnected { peer: a, address: addr_a });
            debug!(a = %a, b = %b, "memory link established");
            Ok(())
        }

        fn unlink(&self, a: PeerId, b: PeerId) {
            if self.links.write().remove(&link_key(a, b)) {
                self.emit(&a, TransportEvent::PeerDisconnected(b));
                self.emit(&b, TransportEvent::PeerDisconnected(a));
            }
        }

        fn deliver(&self, from: PeerId, to: &PeerId, message: WireMessage) -> Result<(), TransportError> {
            let key = link_key(from, *to);
            if !self.links.read().contains(&key) {
                return Err(TransportError::NotConnected(*to));
            }
            if self.partitioned.read().contains(&key) {
                trace!(from = %from, to = %to, "dropping message across partition");
                return Ok(());
            }
            if self.emit(to, TransportEvent::MessageReceived { from, message }) {
                Ok(())
            } else {
                Err(TransportError::ConnectionClosed)
            }
        }
    }

    /// In-memory transport implementation.
    pub struct MemoryTransport {
        peer: PeerId,
        address: String,
        network: Arc<MemoryNetwork>,
    }

    impl MemoryTransport {
        /// Drop the link to `peer`, notifying both sides.
        pub fn disconnect(&self, peer: &PeerId) {
            self.network.unlink(self.peer, *peer);
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        fn local_peer(&self) -> PeerId {
            self.peer
        }

        fn local_address(&self) -> String {
            self.address.clone()
        }

        async fn connect(&self, address: &str) -> Result<PeerId, TransportError> {
            let target = self
                .network
                .addresses
                .read()
                .get(address)
                .copied()
                .ok_or_else(|| TransportError::UnknownAddress(address.to_string()))?;
            self.network.link(self.peer, target)?;
            Ok(target)
        }

        async fn send(&self, peer: &PeerId, message: WireMessage) -> Result<(), TransportError> {
            self.network.deliver(self.peer, peer, message)
        }

        async fn broadcast(&self, message: WireMessage) -> usize {
            let mut delivered = 0;
            for peer in self.network.neighbours(&self.peer) {
                if self.network.deliver(self.peer, &peer, message.clone()).is_ok() {
                    delivered += 1;
                }
            }
            delivered
        }

        fn connected_peers(&self) -> Vec<PeerId> {
            self.network.neighbours(&self.peer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryNetwork;
    use super::*;
    use crate::messages::AntiEntropyMessage;

    fn ping() -> WireMessage {
        WireMessage::AntiEntropy(AntiEntropyMessage::Inventory { ids: vec![] })
    }

    #[tokio::test]
    async fn test_memory_transport_send_recv() {
        let network = MemoryNetwork::new();
        let a = PeerId([0xAA; 32]);
        let b = PeerId([0xBB; 32]);

        let (transport_a, mut rx_a) = network.join(a, "mem://a");
        let (_transport_b, mut rx_b) = network.join(b, "mem://b");

        // Sending before a link exists fails
        assert!(transport_a.send(&b, ping()).await.is_err());

        let connected = transport_a.connect("mem://b").await.unwrap();
        assert_eq!(connected, b);

        match rx_a.recv().await.unwrap() {
            TransportEvent::PeerConnected { peer, address } => {
                assert_eq!(peer, b);
                assert_eq!(address, "mem://b");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            TransportEvent::PeerConnected { .. }
        ));

        transport_a.send(&b, ping()).await.unwrap();
        match rx_b.recv().await.unwrap() {
            TransportEvent::MessageReceived { from, .. } => assert_eq!(from, a),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_memory_transport_broadcast() {
        let network = MemoryNetwork::new();
        let a = PeerId([0xAA; 32]);
        let b = PeerId([0xBB; 32]);
        let c = PeerId([0xCC; 32]);

        let (transport_a, _rx_a) = network.join(a, "mem://a");
        let (_tb, mut rx_b) = network.join(b, "mem://b");
        let (_tc, mut rx_c) = network.join(c, "mem://c");

        transport_a.connect("mem://b").await.unwrap();
        transport_a.connect("mem://c").await.unwrap();
        assert_eq!(transport_a.broadcast(ping()).await, 2);

        for rx in [&mut rx_b, &mut rx_c] {
            // PeerConnected first, then the broadcast
            assert!(matches!(rx.recv().await.unwrap(), TransportEvent::PeerConnected { .. }));
            assert!(matches!(
                rx.recv().await.unwrap(),
                TransportEvent::MessageReceived { from, .. } if from == a
            ));
        }
    }

    #[tokio::test]
    async fn test_partition_drops_silently() {
        let network = MemoryNetwork::new();
        let a = PeerId([1; 32]);
        let b = PeerId([2; 32]);
        let (transport_a, _rx_a) = network.join(a, "mem://a");
        let (_tb, mut rx_b) = network.join(b, "mem://b");
        transport_a.connect("mem://b").await.unwrap();
        let _ = rx_b.recv().await;

        network.partition(a, b);
        assert!(transport_a.send(&b, ping()).await.is_ok());
        assert!(rx_b.try_recv().is_err());

        network.heal(a, b);
        transport_a.send(&b, ping()).await.unwrap();
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_leave_disconnects() {
        let network = MemoryNetwork::new();
        let a = PeerId([1; 32]);
        let b = PeerId([2; 32]);
        let (transport_a, mut rx_a) = network.join(a, "mem://a");
        let (_tb, _rx_b) = network.join(b, "mem://b");
        transport_a.connect("mem://b").await.unwrap();
        let _ = rx_a.recv().await;

        network.leave(&b);
        assert!(matches!(
            rx_a.recv().await.unwrap(),
            TransportEvent::PeerDisconnected(p) if p == b
        ));
        assert!(transport_a.connected_peers().is_empty());
        assert!(transport_a.connect("mem://b").await.is_err());
    }
}
