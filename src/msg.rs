//! Messages flowing into and between peers.
//!
//! Two layers live here. [`PeerMsg`] is the mailbox type a region's event
//! loop consumes: ticks, wire traffic, client commands with their callback.
//! [`RaftMessage`] is the peer-to-peer wire envelope: it wraps a translated
//! Raft-algorithm message together with the routing and fencing metadata
//! (region id, peer descriptors, region epoch, tombstone flag) the receiver
//! needs before it may step the inner message into its Raft group.
//!
//! The inner message is carried field-by-field ([`WireMessage`]) rather
//! than as an opaque blob so the receiving side re-validates everything it
//! turns into a `raft::eraftpb::Message`.

use std::fmt;

use protobuf::ProtobufEnum;
use raft::eraftpb::{Entry, EntryType, Message, MessageType};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::cmd::{RaftCmdRequest, RaftCmdResponse};
use crate::error::{Error, Result};
use crate::region::{PeerMeta, RegionEpoch};

/// Discriminates what the wire envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMsgKind {
    /// An inner Raft-algorithm message for `step`.
    Normal,
    /// A client command forwarded from another node; `data` holds the
    /// encoded [`RaftCmdRequest`].
    ClientCmd,
    /// A leadership transfer order; `data` holds the encoded target peer.
    TransferLeader,
}

/// One log entry inside a wire message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireEntry {
    pub entry_type: i32,
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

impl WireEntry {
    pub fn from_raft(e: &Entry) -> Self {
        Self {
            entry_type: e.get_entry_type().value(),
            index: e.index,
            term: e.term,
            data: e.data.to_vec(),
        }
    }

    pub fn into_raft(self) -> Result<Entry> {
        let entry_type = EntryType::from_i32(self.entry_type)
            .ok_or_else(|| Error::InvalidMessage(format!("unknown entry type {}", self.entry_type)))?;
        let mut e = Entry::default();
        e.set_entry_type(entry_type);
        e.index = self.index;
        e.term = self.term;
        e.data = self.data.into();
        Ok(e)
    }
}

/// The Raft-algorithm message, flattened for the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub msg_type: i32,
    pub from: u64,
    pub to: u64,
    pub term: u64,
    pub log_term: u64,
    pub index: u64,
    pub commit: u64,
    pub reject: bool,
    pub entries: Vec<WireEntry>,
    /// Opaque payload forwarded untouched (leader transfer context etc.).
    pub context: Vec<u8>,
}

impl WireMessage {
    pub fn from_raft(m: &Message) -> Self {
        Self {
            msg_type: m.get_msg_type().value(),
            from: m.from,
            to: m.to,
            term: m.term,
            log_term: m.log_term,
            index: m.index,
            commit: m.commit,
            reject: m.reject,
            entries: m.get_entries().iter().map(WireEntry::from_raft).collect(),
            context: m.get_context().to_vec(),
        }
    }

    pub fn into_raft(self) -> Result<Message> {
        let msg_type = MessageType::from_i32(self.msg_type)
            .ok_or_else(|| Error::InvalidMessage(format!("unknown message type {}", self.msg_type)))?;
        let mut m = Message::default();
        m.set_msg_type(msg_type);
        m.from = self.from;
        m.to = self.to;
        m.term = self.term;
        m.log_term = self.log_term;
        m.index = self.index;
        m.commit = self.commit;
        m.reject = self.reject;
        for e in self.entries {
            m.mut_entries().push(e.into_raft()?);
        }
        m.set_context(self.context.into());
        Ok(m)
    }

    /// Whether this is a (pre-)vote request. Stale votes are fenced
    /// differently from stale replication traffic.
    pub fn is_vote(&self) -> bool {
        self.msg_type == MessageType::MsgRequestVote.value()
            || self.msg_type == MessageType::MsgRequestPreVote.value()
    }
}

/// Peer-to-peer wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftMessage {
    pub region_id: u64,
    pub from_peer: PeerMeta,
    pub to_peer: PeerMeta,
    /// The sender's view of the region epoch, used for staleness fencing.
    pub region_epoch: RegionEpoch,
    pub kind: RaftMsgKind,
    /// Present when `kind` is `Normal`.
    pub message: Option<WireMessage>,
    /// Kind-specific payload for `ClientCmd` / `TransferLeader`.
    pub data: Vec<u8>,
    /// Tells the receiver its replica was removed and can be garbage
    /// collected.
    pub is_tombstone: bool,
}

/// Single-shot completion handle for an accepted proposal.
///
/// The sender half is consumed on completion, so a proposal can never be
/// answered twice. Fire-and-forget paths (commands forwarded over the wire)
/// use [`Callback::none`].
pub struct Callback(Option<oneshot::Sender<Result<RaftCmdResponse>>>);

impl Callback {
    /// A callback nobody is waiting on.
    pub fn none() -> Self {
        Callback(None)
    }

    /// A callback paired with the receiver the client awaits.
    pub fn new() -> (Self, oneshot::Receiver<Result<RaftCmdResponse>>) {
        let (tx, rx) = oneshot::channel();
        (Callback(Some(tx)), rx)
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    /// Complete the proposal. A dropped receiver is fine; the client went
    /// away.
    pub fn invoke(self, resp: Result<RaftCmdResponse>) {
        if let Some(tx) = self.0 {
            let _ = tx.send(resp);
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_some() {
            write!(f, "Callback")
        } else {
            write!(f, "Callback::None")
        }
    }
}

/// A client command headed for the Raft log, with its completion handle.
#[derive(Debug)]
pub struct RaftCommand {
    pub request: RaftCmdRequest,
    pub callback: Callback,
}

impl RaftCommand {
    pub fn new(request: RaftCmdRequest, callback: Callback) -> Self {
        Self { request, callback }
    }
}

/// Everything a region's event loop can receive.
#[derive(Debug)]
pub enum PeerMsg {
    /// Peer-to-peer traffic from the wire.
    RaftMessage(RaftMessage),
    /// A local client command.
    RaftCommand(RaftCommand),
    /// Drive timers of the Raft group.
    Tick,
    /// Bootstrap tick scheduling after the peer is spawned.
    Start,
    /// Split request; accepted but not acted on yet.
    SplitRegion { split_key: Vec<u8> },
    /// Size estimation report; accepted but not acted on yet.
    RegionApproximateSize(u64),
    /// Snapshot GC trigger; accepted but not acted on yet.
    GcSnap,
}
