//! Outbound message transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam::channel::{self, Receiver, Sender};

use crate::msg::RaftMessage;

/// Fire-and-forget sender for peer-to-peer messages, keyed by the target
/// peer id. Delivery failures are the transport's problem: Raft retransmits
/// whatever mattered.
pub trait Transport: Send + Sync {
    fn send(&self, msg: RaftMessage);
}

/// In-process transport routing messages over crossbeam channels.
///
/// Production deployments put a network here; tests and single-process
/// clusters register one channel per peer.
#[derive(Clone, Default)]
pub struct ChannelTransport {
    inboxes: Arc<Mutex<HashMap<u64, Sender<RaftMessage>>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an inbox for `peer_id`, returning the receiving half.
    pub fn register(&self, peer_id: u64) -> Receiver<RaftMessage> {
        let (tx, rx) = channel::unbounded();
        self.inboxes.lock().unwrap().insert(peer_id, tx);
        rx
    }

    pub fn deregister(&self, peer_id: u64) {
        self.inboxes.lock().unwrap().remove(&peer_id);
    }
}

impl Transport for ChannelTransport {
    fn send(&self, msg: RaftMessage) {
        let to = msg.to_peer.id;
        let sender = self.inboxes.lock().unwrap().get(&to).cloned();
        match sender {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    tracing::warn!(to, "peer inbox closed, dropping message");
                }
            }
            None => {
                tracing::warn!(to, "no route to peer, dropping message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::RaftMsgKind;
    use crate::region::{PeerMeta, RegionEpoch};

    fn wire_msg(to: u64) -> RaftMessage {
        RaftMessage {
            region_id: 1,
            from_peer: PeerMeta::new(1, 1),
            to_peer: PeerMeta::new(to, to),
            region_epoch: RegionEpoch::default(),
            kind: RaftMsgKind::Normal,
            message: None,
            data: Vec::new(),
            is_tombstone: false,
        }
    }

    #[test]
    fn test_routes_by_peer_id() {
        let trans = ChannelTransport::new();
        let rx = trans.register(2);
        trans.send(wire_msg(2));
        assert_eq!(rx.try_recv().unwrap().to_peer.id, 2);
    }

    #[test]
    fn test_unknown_peer_is_dropped() {
        let trans = ChannelTransport::new();
        // No panic, message silently dropped.
        trans.send(wire_msg(9));
    }
}
