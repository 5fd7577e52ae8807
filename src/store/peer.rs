//! Per-region replica runtime state.
//!
//! A [`Peer`] owns its `RawNode` exclusively; every method of it and of the
//! message handler runs on the region's single event-loop thread. raft-rs's
//! `RawNode` is not thread-safe and must never leak out of this ownership.

use std::collections::{HashMap, VecDeque};

use raft::eraftpb::Message;
use raft::{RawNode, StateRole};
use slog::o;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::msg::{Callback, RaftMessage, RaftMsgKind, WireMessage};
use crate::region::{PeerMeta, Region};
use crate::store::peer_storage::{Engines, PeerStorage};
use crate::store::transport::Transport;

/// A client command that made it into the log, waiting for its entry to
/// commit and apply. Matched by `(index, term)` in insertion order.
#[derive(Debug)]
pub struct Proposal {
    pub index: u64,
    pub term: u64,
    pub callback: Callback,
}

/// One replica of a region.
pub struct Peer {
    peer_id: u64,
    store_id: u64,
    region_id: u64,
    /// The Raft group. Exclusive to this peer's event loop.
    pub raft_group: RawNode<PeerStorage>,
    /// Outstanding proposals in insertion (and therefore index) order.
    pub proposals: VecDeque<Proposal>,
    /// Routing info for co-peers, refreshed on membership changes.
    peer_cache: HashMap<u64, PeerMeta>,
    /// Set on removal or store shutdown; a stopped peer drops everything.
    pub stopped: bool,
}

impl Peer {
    pub fn new(cfg: &Config, engines: Engines, region: Region, peer_id: u64) -> Result<Peer> {
        let region_id = region.id;
        // The persisted descriptor wins over the caller's copy on restart.
        let storage = PeerStorage::new(engines, region, peer_id)?;
        let region = storage.region();
        let store_id = region
            .peer_by_id(peer_id)
            .map(|p| p.store_id)
            .ok_or_else(|| {
                Error::Config(format!(
                    "peer {} is not a member of region {}",
                    peer_id, region_id
                ))
            })?;
        let peer_cache: HashMap<_, _> = region.peers.iter().map(|p| (p.id, p.clone())).collect();

        let raft_cfg = cfg.raft_config(peer_id, storage.applied_index());
        raft_cfg.validate()?;
        // raft-rs wants an slog logger; application logs go through tracing.
        let logger = slog::Logger::root(slog::Discard, o!());
        let raft_group = RawNode::new(&raft_cfg, storage, &logger)?;

        tracing::info!(region = region_id, peer = peer_id, store = store_id, "peer created");
        Ok(Peer {
            peer_id,
            store_id,
            region_id,
            raft_group,
            proposals: VecDeque::new(),
            peer_cache,
            stopped: false,
        })
    }

    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    pub fn store_id(&self) -> u64 {
        self.store_id
    }

    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    pub fn region(&self) -> &Region {
        self.raft_group.store().region()
    }

    pub fn peer_meta(&self) -> PeerMeta {
        PeerMeta::new(self.peer_id, self.store_id)
    }

    pub fn term(&self) -> u64 {
        self.raft_group.raft.term
    }

    pub fn is_leader(&self) -> bool {
        self.raft_group.raft.state == StateRole::Leader
    }

    /// The leader this peer currently believes in; 0 when unknown.
    pub fn leader_id(&self) -> u64 {
        self.raft_group.raft.leader_id
    }

    /// Index the next accepted proposal will occupy.
    pub fn next_proposal_index(&self) -> u64 {
        self.raft_group.raft.raft_log.last_index() + 1
    }

    pub fn mut_store(&mut self) -> &mut PeerStorage {
        self.raft_group.mut_store()
    }

    pub fn insert_peer_cache(&mut self, peer: PeerMeta) {
        self.peer_cache.insert(peer.id, peer);
    }

    pub fn remove_peer_cache(&mut self, peer_id: u64) {
        self.peer_cache.remove(&peer_id);
    }

    /// Routing info for a co-peer, falling back to the region descriptor.
    pub fn get_peer_from_cache(&mut self, peer_id: u64) -> Option<PeerMeta> {
        if let Some(peer) = self.peer_cache.get(&peer_id) {
            return Some(peer.clone());
        }
        let found = self.region().peer_by_id(peer_id).cloned();
        if let Some(peer) = &found {
            self.peer_cache.insert(peer_id, peer.clone());
        }
        found
    }

    /// Wrap outgoing Raft messages in the wire envelope and hand them to
    /// the transport. Messages without routing info are dropped; Raft
    /// retransmits what matters.
    pub fn send<T: Transport>(&mut self, trans: &T, msgs: Vec<Message>) {
        for msg in msgs {
            self.send_raft_message(trans, msg);
        }
    }

    fn send_raft_message<T: Transport>(&mut self, trans: &T, msg: Message) {
        let to_peer = match self.get_peer_from_cache(msg.to) {
            Some(peer) => peer,
            None => {
                tracing::warn!(
                    region = self.region_id,
                    to = msg.to,
                    "unknown target peer, dropping message"
                );
                return;
            }
        };
        let wire = RaftMessage {
            region_id: self.region_id,
            from_peer: self.peer_meta(),
            to_peer,
            region_epoch: self.region().epoch,
            kind: RaftMsgKind::Normal,
            message: Some(WireMessage::from_raft(&msg)),
            data: Vec::new(),
            is_tombstone: false,
        };
        trans.send(wire);
    }

    /// Tear the peer down: no further messages are processed and every
    /// outstanding proposal learns the region is gone.
    pub fn destroy(&mut self) {
        tracing::info!(region = self.region_id, peer = self.peer_id, "destroying peer");
        self.stopped = true;
        for proposal in self.proposals.drain(..) {
            proposal
                .callback
                .invoke(Err(Error::RegionNotFound(self.region_id)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionEpoch;

    fn test_region() -> Region {
        Region {
            id: 1,
            start_key: Vec::new(),
            end_key: Vec::new(),
            epoch: RegionEpoch::default(),
            peers: vec![PeerMeta::new(1, 1), PeerMeta::new(2, 2)],
        }
    }

    fn create_test_peer() -> Peer {
        let engines = Engines::open_temporary().unwrap();
        Peer::new(&Config::default(), engines, test_region(), 1).unwrap()
    }

    #[test]
    fn test_peer_identity() {
        let peer = create_test_peer();
        assert_eq!(peer.peer_id(), 1);
        assert_eq!(peer.store_id(), 1);
        assert_eq!(peer.region_id(), 1);
        assert!(!peer.is_leader());
        assert_eq!(peer.next_proposal_index(), 1);
    }

    #[test]
    fn test_unknown_member_is_rejected() {
        let engines = Engines::open_temporary().unwrap();
        let result = Peer::new(&Config::default(), engines, test_region(), 9);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_peer_cache_falls_back_to_region() {
        let mut peer = create_test_peer();
        peer.remove_peer_cache(2);
        let found = peer.get_peer_from_cache(2).unwrap();
        assert_eq!(found, PeerMeta::new(2, 2));
        assert!(peer.get_peer_from_cache(42).is_none());
    }

    #[test]
    fn test_destroy_fails_outstanding_proposals() {
        let mut peer = create_test_peer();
        let (cb, mut rx) = Callback::new();
        peer.proposals.push_back(Proposal {
            index: 7,
            term: 1,
            callback: cb,
        });

        peer.destroy();
        assert!(peer.stopped);
        assert!(peer.proposals.is_empty());
        match rx.try_recv().unwrap() {
            Err(Error::RegionNotFound(1)) => {}
            other => panic!("unexpected completion: {other:?}"),
        }
    }
}
