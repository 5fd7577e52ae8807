//! rangekv — a replicated key-value region store.
//!
//! A store hosts replicas ("peers") of key ranges ("regions"), each region
//! replicated by its own Raft group (tikv/raft-rs). The crate's core is the
//! per-region peer event loop in [`store::PeerMsgHandler`]: it feeds
//! inbound messages into the Raft group, persists and transmits the
//! group's `Ready` output, and applies committed entries to the durable
//! engine atomically with the region's applied-index bookkeeping.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ RaftStore                                                    │
//! │   ┌─ region 1 event loop ── Peer ── RawNode<PeerStorage> ─┐  │
//! │   ├─ region 2 event loop ── Peer ── RawNode<PeerStorage> ─┤  │
//! │   │        ...                                            │  │
//! │   │   StoreMeta (regions map, mutex)                      │  │
//! │   │   TickQueue (bounded) ──> tick driver thread          │  │
//! │   └───────────────┬───────────────────────┬───────────────┘  │
//! │                   ▼                       ▼                  │
//! │             KvEngine (redb)        Transport (wire)          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Consistency hinges on one rule: the user-visible writes of applied
//! entries and the advance of the region's `ApplyState` share a single
//! engine write batch. See [`store::PeerMsgHandler::handle_raft_ready`].

pub mod cmd;
pub mod config;
pub mod engine;
pub mod error;
pub mod keys;
pub mod msg;
pub mod region;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
