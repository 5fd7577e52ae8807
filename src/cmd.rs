//! Command schema.
//!
//! Commands are the payload of Normal log entries and the body of client
//! requests: the same bincode encoding is used on the wire and in the Raft
//! log, so an entry replayed after restart decodes exactly like the original
//! proposal. Conf-change entries carry the admin request in the
//! `ConfChange.context` field using the same encoding.

use raft::eraftpb::ConfChangeType;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::region::{PeerMeta, Region, RegionEpoch};

/// Header carried by every command, used to fence stale or misrouted
/// requests before they reach the Raft log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub region_id: u64,
    /// The peer the client believes it is talking to.
    pub peer: PeerMeta,
    pub region_epoch: RegionEpoch,
    /// Term the client observed; 0 means unknown.
    pub term: u64,
}

/// A single key-value operation inside a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Get { cf: String, key: Vec<u8> },
    Put { cf: String, key: Vec<u8>, value: Vec<u8> },
    Delete { cf: String, key: Vec<u8> },
    /// Read the region descriptor (epoch-fenced).
    Snap,
}

impl Request {
    /// The user key this request touches, when it touches one.
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            Request::Get { key, .. } | Request::Put { key, .. } | Request::Delete { key, .. } => {
                Some(key)
            }
            Request::Snap => None,
        }
    }
}

/// Direction of a membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangePeerType {
    AddNode,
    RemoveNode,
}

impl From<ChangePeerType> for ConfChangeType {
    fn from(t: ChangePeerType) -> ConfChangeType {
        match t {
            ChangePeerType::AddNode => ConfChangeType::AddNode,
            ChangePeerType::RemoveNode => ConfChangeType::RemoveNode,
        }
    }
}

/// Administrative operations on a region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AdminRequest {
    ChangePeer {
        change_type: ChangePeerType,
        peer: PeerMeta,
    },
    TransferLeader {
        peer: PeerMeta,
    },
    Split {
        split_key: Vec<u8>,
    },
    CompactLog {
        compact_index: u64,
        compact_term: u64,
    },
}

/// A client command: either a batch of KV requests or one admin request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RaftCmdRequest {
    pub header: RequestHeader,
    pub requests: Vec<Request>,
    pub admin_request: Option<AdminRequest>,
}

impl RaftCmdRequest {
    pub fn new(header: RequestHeader, requests: Vec<Request>) -> Self {
        Self {
            header,
            requests,
            admin_request: None,
        }
    }

    pub fn new_admin(header: RequestHeader, admin: AdminRequest) -> Self {
        Self {
            header,
            requests: Vec::new(),
            admin_request: Some(admin),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.admin_request.is_some()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Mirror of [`Request`] carrying the per-operation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Get { value: Option<Vec<u8>> },
    Put,
    Delete,
    Snap { region: Region },
}

/// Mirror of [`AdminRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AdminResponse {
    ChangePeer { region: Region },
    TransferLeader,
    Split,
    CompactLog,
}

/// Response delivered to the proposal callback once the command applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RaftCmdResponse {
    pub responses: Vec<Response>,
    pub admin_response: Option<AdminResponse>,
}
