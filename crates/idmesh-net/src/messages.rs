//! Wire envelope exchanged between idmesh nodes
//!
//! Byte-level framing belongs to the external transport; these types only
//! fix what a node sends and expects to receive.

use idmesh_core::types::*;
use serde::{Deserialize, Serialize};

/// Top-level message carried by the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Signed gossip message (epidemic and sync kinds)
    Gossip(GossipMessage),
    /// Inventory reconciliation between two gossip peers
    AntiEntropy(AntiEntropyMessage),
    /// Kademlia RPC
    Dht(DhtMessage),
}

impl WireMessage {
    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            WireMessage::Gossip(m) => m.kind.as_str(),
            WireMessage::AntiEntropy(AntiEntropyMessage::Inventory { .. }) => "ae_inventory",
            WireMessage::AntiEntropy(AntiEntropyMessage::Request { .. }) => "ae_request",
            WireMessage::AntiEntropy(AntiEntropyMessage::Push { .. }) => "ae_push",
            WireMessage::Dht(m) => m.label(),
        }
    }
}

/// Anti-entropy exchange.
///
/// The initiator sends `Inventory`; the receiver answers with `Request` for
/// ids it lacks and `Push` for messages the initiator lacks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AntiEntropyMessage {
    Inventory { ids: Vec<MessageId> },
    Request { ids: Vec<MessageId> },
    Push { messages: Vec<GossipMessage> },
}

/// Kademlia RPCs. Every message carries the sender's contact so receivers
/// learn routing entries from ordinary traffic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtMessage {
    Ping {
        request_id: u64,
        sender: DhtContact,
    },
    Pong {
        request_id: u64,
        sender: DhtContact,
    },
    FindValue {
        request_id: u64,
        sender: DhtContact,
        key: String,
    },
    FindValueReply {
        request_id: u64,
        sender: DhtContact,
        record: Option<DhtRecord>,
        closer: Vec<DhtContact>,
    },
    /// Fire-and-forget replication; never acknowledged
    Store { sender: DhtContact, record: DhtRecord },
}

impl DhtMessage {
    pub fn sender(&self) -> &DhtContact {
        match self {
            DhtMessage::Ping { sender, .. }
            | DhtMessage::Pong { sender, .. }
            | DhtMessage::FindValue { sender, .. }
            | DhtMessage::FindValueReply { sender, .. }
            | DhtMessage::Store { sender, .. } => sender,
        }
    }

    /// Correlation id for replies
    pub fn reply_to(&self) -> Option<u64> {
        match self {
            DhtMessage::Pong { request_id, .. } | DhtMessage::FindValueReply { request_id, .. } => {
                Some(*request_id)
            }
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DhtMessage::Ping { .. } => "dht_ping",
            DhtMessage::Pong { .. } => "dht_pong",
            DhtMessage::FindValue { .. } => "dht_find_value",
            DhtMessage::FindValueReply { .. } => "dht_find_value_reply",
            DhtMessage::Store { .. } => "dht_store",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> DhtContact {
        DhtContact {
            id: NodeId([1; NODE_ID_LEN]),
            peer: PeerId([2; 32]),
            address: "mem://a".into(),
            last_seen: 0,
        }
    }

    #[test]
    fn test_reply_correlation() {
        let pong = DhtMessage::Pong {
            request_id: 7,
            sender: contact(),
        };
        assert_eq!(pong.reply_to(), Some(7));

        let ping = DhtMessage::Ping {
            request_id: 7,
            sender: contact(),
        };
        assert_eq!(ping.reply_to(), None);
        assert_eq!(ping.sender().address, "mem://a");
    }

    #[test]
    fn test_labels() {
        let msg = WireMessage::AntiEntropy(AntiEntropyMessage::Request { ids: vec![] });
        assert_eq!(msg.label(), "ae_request");
    }
}
