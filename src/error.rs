//! Error types for the region store.

use thiserror::Error;

use crate::region::{PeerMeta, RegionEpoch};

/// Errors surfaced by the store, both to client callbacks and internally.
#[derive(Debug, Error)]
pub enum Error {
    /// The request was routed to a store that does not host the target peer.
    #[error("store not match, request store {to_store_id}, actual store {my_store_id}")]
    StoreNotMatch { to_store_id: u64, my_store_id: u64 },

    /// This peer is not the leader of the region.
    #[error("not leader of region {region_id}, leader hint: {leader:?}")]
    NotLeader {
        region_id: u64,
        /// Best-effort routing hint resolved from the peer cache.
        leader: Option<PeerMeta>,
    },

    /// The request names a peer id other than this replica's.
    #[error("peer mismatch, request peer {request_peer_id}, actual peer {my_peer_id}")]
    PeerMismatch {
        request_peer_id: u64,
        my_peer_id: u64,
    },

    /// The region is not (or no longer) served by this store.
    #[error("region {0} not found")]
    RegionNotFound(u64),

    /// The key falls outside the region's `[start_key, end_key)` range.
    #[error("key {key:?} not in region {region_id}")]
    KeyNotInRegion { key: Vec<u8>, region_id: u64 },

    /// The request carries a region epoch older than the current one.
    #[error("epoch not match for region {region_id}, current epoch {current:?}")]
    EpochNotMatch {
        region_id: u64,
        current: RegionEpoch,
    },

    /// The proposal was superseded before it could be applied.
    #[error("stale command")]
    StaleCommand,

    /// A wire message could not be translated into its Raft form.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A committed entry failed to decode. Applying it again will not help;
    /// the region is stopped so restart can surface the defect.
    #[error("corrupted entry at index {index}: {reason}")]
    Corruption { index: u64, reason: String },

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Engine (durable storage) failure.
    #[error("engine error: {0}")]
    Engine(#[from] crate::engine::EngineError),

    /// Raft protocol error.
    #[error("raft error: {0}")]
    Raft(#[from] raft::Error),

    /// Serialization/deserialization error.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Result type used throughout the store.
pub type Result<T> = std::result::Result<T, Error>;
