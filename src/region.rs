//! Region metadata: descriptors, epochs and apply bookkeeping.
//!
//! A region is a contiguous key range replicated by one Raft group; each
//! replica of it on a store is a peer. These types are the durable shape of
//! that metadata — they are bincode-encoded into the engine under the keys
//! in [`crate::keys`] and carried on the wire inside command headers.

use raft::eraftpb::ConfState;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One replica of a region, as listed in the region descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMeta {
    pub id: u64,
    pub store_id: u64,
}

impl PeerMeta {
    pub fn new(id: u64, store_id: u64) -> Self {
        Self { id, store_id }
    }
}

/// Version pair fencing stale requests and messages.
///
/// `conf_ver` increments on every membership change, `version` on every
/// split or merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

/// Descriptor of a region: its key range, epoch and membership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: u64,
    /// Inclusive start of the key range.
    pub start_key: Vec<u8>,
    /// Exclusive end of the key range; empty means unbounded.
    pub end_key: Vec<u8>,
    pub epoch: RegionEpoch,
    pub peers: Vec<PeerMeta>,
}

impl Region {
    /// Look up a peer by its id.
    pub fn peer_by_id(&self, peer_id: u64) -> Option<&PeerMeta> {
        self.peers.iter().find(|p| p.id == peer_id)
    }

    /// Look up the peer hosted on a given store.
    pub fn peer_on_store(&self, store_id: u64) -> Option<&PeerMeta> {
        self.peers.iter().find(|p| p.store_id == store_id)
    }

    /// Whether `key` falls inside `[start_key, end_key)`.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }
}

/// The `(index, term)` above which the Raft log has been discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncatedState {
    pub index: u64,
    pub term: u64,
}

/// Durable apply bookkeeping for one region.
///
/// `applied_index` is advanced in the same engine write batch as the
/// user-visible effects of the entry that advanced it, which is what makes
/// crash recovery a pure re-apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyState {
    pub applied_index: u64,
    pub truncated_state: TruncatedState,
}

/// Lifecycle state of a peer as recorded on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    /// The peer serves the region.
    Normal,
    /// The peer has been removed from the region and awaits GC.
    Tombstone,
    /// The peer is installing a snapshot.
    Applying,
}

/// Durable region descriptor plus its lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionLocalState {
    pub state: PeerState,
    pub region: Region,
}

/// Derive the Raft voter set from the region's membership.
pub fn conf_state_from_region(region: &Region) -> ConfState {
    let mut cs = ConfState::default();
    cs.set_voters(region.peers.iter().map(|p| p.id).collect());
    cs
}

/// Whether `epoch` is strictly older than `current`.
pub fn is_epoch_stale(epoch: &RegionEpoch, current: &RegionEpoch) -> bool {
    epoch.conf_ver < current.conf_ver || epoch.version < current.version
}

/// Fail with `KeyNotInRegion` when the key is outside the region's range.
pub fn check_key_in_region(key: &[u8], region: &Region) -> Result<()> {
    if region.contains_key(key) {
        Ok(())
    } else {
        Err(Error::KeyNotInRegion {
            key: key.to_vec(),
            region_id: region.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_with_range(start: &[u8], end: &[u8]) -> Region {
        Region {
            id: 1,
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            epoch: RegionEpoch::default(),
            peers: vec![PeerMeta::new(1, 1)],
        }
    }

    #[test]
    fn test_contains_key_bounds() {
        let r = region_with_range(b"b", b"d");
        assert!(!r.contains_key(b"a"));
        assert!(r.contains_key(b"b"));
        assert!(r.contains_key(b"c"));
        assert!(!r.contains_key(b"d"));

        let unbounded = region_with_range(b"", b"");
        assert!(unbounded.contains_key(b""));
        assert!(unbounded.contains_key(&[0xff; 8]));
    }

    #[test]
    fn test_epoch_staleness() {
        let current = RegionEpoch { conf_ver: 2, version: 3 };
        let same = current;
        let newer = RegionEpoch { conf_ver: 3, version: 3 };
        let old_conf = RegionEpoch { conf_ver: 1, version: 3 };
        let old_version = RegionEpoch { conf_ver: 2, version: 2 };
        assert!(!is_epoch_stale(&same, &current));
        assert!(!is_epoch_stale(&newer, &current));
        assert!(is_epoch_stale(&old_conf, &current));
        assert!(is_epoch_stale(&old_version, &current));
    }

    #[test]
    fn test_conf_state_lists_all_voters() {
        let mut r = region_with_range(b"", b"");
        r.peers.push(PeerMeta::new(2, 2));
        let cs = conf_state_from_region(&r);
        assert_eq!(cs.get_voters(), &[1, 2]);
    }
}
