//! The per-region peer event loop.
//!
//! [`PeerMsgHandler`] is the single writer for one region replica. It
//! funnels everything the region receives — ticks, peer-to-peer Raft
//! traffic, client proposals, administrative actions — into the Raft group,
//! and turns the group's output back into durable state and completed
//! callbacks:
//!
//! ```text
//!  PeerMsg ──> handle_msg ──> RawNode (tick / step / propose)
//!                               │
//!                               ▼ Ready
//!              handle_raft_ready:
//!                1. save log + hard state   (PeerStorage)
//!                2. ship outgoing messages  (Transport)
//!                3. apply committed entries (one WriteBatch)
//!                4. advance applied index   (same WriteBatch)
//!                5. advance the Raft group
//! ```
//!
//! The ordering is the whole point: an entry's user-visible writes and the
//! applied-index bump commit in one atomic batch, so a crash anywhere
//! re-applies from the last durable applied index and nothing is observed
//! twice or lost.
//!
//! The dispatcher never runs the Ready cycle itself; the store's event-loop
//! driver calls [`handle_raft_ready`](PeerMsgHandler::handle_raft_ready)
//! after each dispatch batch.

use std::collections::VecDeque;

use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfChange, ConfChangeType, Entry, EntryType};

use crate::cmd::{
    AdminRequest, AdminResponse, RaftCmdRequest, RaftCmdResponse, Request, Response,
};
use crate::engine::WriteBatch;
use crate::error::{Error, Result};
use crate::keys;
use crate::msg::{Callback, PeerMsg, RaftMessage, RaftMsgKind};
use crate::region::{
    check_key_in_region, is_epoch_stale, ApplyState, PeerMeta, PeerState, Region,
    RegionEpoch, RegionLocalState, TruncatedState,
};
use crate::store::peer::{Peer, Proposal};
use crate::store::transport::Transport;
use crate::store::StoreContext;

/// Single-writer handler bound to one region replica for one dispatch
/// round. Construct it fresh from the owning event loop; it borrows the
/// peer exclusively.
pub struct PeerMsgHandler<'a, T: Transport> {
    peer: &'a mut Peer,
    ctx: &'a StoreContext<T>,
}

impl<'a, T: Transport> PeerMsgHandler<'a, T> {
    pub fn new(peer: &'a mut Peer, ctx: &'a StoreContext<T>) -> Self {
        Self { peer, ctx }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Route one inbound message. Failures of a single message are logged
    /// and isolated; they never take the event loop down.
    pub fn handle_msg(&mut self, msg: PeerMsg) {
        match msg {
            PeerMsg::RaftMessage(m) => self.on_wire_msg(m),
            PeerMsg::RaftCommand(cmd) => self.propose_raft_command(cmd.request, cmd.callback),
            PeerMsg::Tick => self.on_tick(),
            PeerMsg::Start => self.start_ticker(),
            PeerMsg::SplitRegion { split_key } => {
                tracing::debug!(
                    region = self.peer.region_id(),
                    ?split_key,
                    "split requested, not supported yet"
                );
            }
            PeerMsg::RegionApproximateSize(size) => {
                tracing::debug!(region = self.peer.region_id(), size, "approximate size report");
            }
            PeerMsg::GcSnap => {
                tracing::debug!(region = self.peer.region_id(), "snap gc requested, nothing to do");
            }
        }
    }

    fn on_wire_msg(&mut self, msg: RaftMessage) {
        match msg.kind {
            RaftMsgKind::Normal => {
                if let Err(e) = self.on_raft_msg(msg) {
                    tracing::debug!(region = self.peer.region_id(), "dropped raft message: {e}");
                }
            }
            RaftMsgKind::ClientCmd => match RaftCmdRequest::decode(&msg.data) {
                Ok(request) => self.propose_raft_command(request, Callback::none()),
                Err(e) => {
                    tracing::warn!(
                        region = self.peer.region_id(),
                        "undecodable client command: {e}"
                    );
                }
            },
            RaftMsgKind::TransferLeader => match bincode::deserialize::<PeerMeta>(&msg.data) {
                Ok(target) => {
                    tracing::info!(
                        region = self.peer.region_id(),
                        target = target.id,
                        "transferring leadership"
                    );
                    self.peer.raft_group.transfer_leader(target.id);
                }
                Err(e) => {
                    tracing::warn!(
                        region = self.peer.region_id(),
                        "undecodable transfer-leader target: {e}"
                    );
                }
            },
        }
    }

    fn on_tick(&mut self) {
        if self.peer.stopped {
            return;
        }
        self.peer.raft_group.tick();
        // Re-arm: the tick driver will deliver the next tick for us.
        self.ctx.tick_queue.push(self.peer.region_id());
    }

    fn start_ticker(&mut self) {
        self.ctx.tick_queue.push(self.peer.region_id());
    }

    // ------------------------------------------------------------------
    // Ready cycle
    // ------------------------------------------------------------------

    /// Drain one Ready batch from the Raft group: persist, transmit, apply,
    /// advance. Apply-time failures are fatal to the region — the peer is
    /// destroyed and the applied index stays put so a restart retries.
    pub fn handle_raft_ready(&mut self) {
        if self.peer.stopped || !self.peer.raft_group.has_ready() {
            return;
        }
        if let Err(e) = self.handle_ready_inner() {
            tracing::error!(
                region = self.peer.region_id(),
                peer = self.peer.peer_id(),
                "fatal error handling ready, stopping region: {e}"
            );
            self.destroy_peer();
        }
    }

    fn handle_ready_inner(&mut self) -> Result<()> {
        let mut ready = self.peer.raft_group.ready();

        // Durability first: unstable entries, hard state, incoming snapshot.
        let snap_result = self.peer.mut_store().save_ready_state(&ready)?;
        if let Some(res) = snap_result {
            let mut meta = self.ctx.store_meta.lock().unwrap();
            meta.regions.insert(res.region.id, res.region.clone());
        }

        // Leader-side messages may go out any time; append responses are
        // only valid now that the log above is durable.
        let msgs = ready.take_messages();
        if !msgs.is_empty() {
            self.peer.send(&self.ctx.trans, msgs);
        }
        let persisted = ready.take_persisted_messages();
        if !persisted.is_empty() {
            self.peer.send(&self.ctx.trans, persisted);
        }

        self.handle_committed_entries(ready.take_committed_entries())?;
        if self.peer.stopped {
            // Removed while applying; the uncommitted batch was dropped and
            // the remaining entries will be re-applied if the peer returns.
            return Ok(());
        }

        let mut light = self.peer.raft_group.advance(ready);
        let light_msgs = light.take_messages();
        if !light_msgs.is_empty() {
            self.peer.send(&self.ctx.trans, light_msgs);
        }
        self.handle_committed_entries(light.take_committed_entries())?;
        if self.peer.stopped {
            return Ok(());
        }
        self.peer.raft_group.advance_apply();
        Ok(())
    }

    /// Apply a run of committed entries into one write batch, then commit
    /// the batch together with the advanced apply state.
    fn handle_committed_entries(&mut self, committed: Vec<Entry>) -> Result<()> {
        if committed.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            region = self.peer.region_id(),
            count = committed.len(),
            first = committed[0].index,
            "applying committed entries"
        );
        let mut wb = WriteBatch::new();
        let mut last_applied = None;
        for entry in &committed {
            self.process(entry, &mut wb)?;
            if self.peer.stopped {
                return Ok(());
            }
            last_applied = Some((entry.index, entry.term));
        }
        if let Some((index, term)) = last_applied {
            self.commit_apply_batch(wb, index, term)?;
        }
        Ok(())
    }

    /// Stage the apply state for `index` into the batch and commit it as
    /// one atomic engine write. The in-memory view advances only after the
    /// write succeeded.
    fn commit_apply_batch(&mut self, mut wb: WriteBatch, index: u64, term: u64) -> Result<()> {
        let apply_state = ApplyState {
            applied_index: index,
            truncated_state: TruncatedState { index, term },
        };
        wb.put_msg(keys::apply_state_key(self.peer.region_id()), &apply_state)?;
        self.peer
            .raft_group
            .store()
            .engines()
            .kv
            .write(wb)?;
        self.peer.mut_store().set_apply_state(apply_state);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entry application
    // ------------------------------------------------------------------

    fn process(&mut self, entry: &Entry, wb: &mut WriteBatch) -> Result<()> {
        match entry.get_entry_type() {
            EntryType::EntryConfChange => {
                let cc = ConfChange::parse_from_bytes(&entry.data).map_err(|e| Error::Corruption {
                    index: entry.index,
                    reason: e.to_string(),
                })?;
                self.process_conf_change(entry, &cc, wb)
            }
            EntryType::EntryConfChangeV2 => Err(Error::Corruption {
                index: entry.index,
                reason: "joint consensus entries are not supported".into(),
            }),
            EntryType::EntryNormal => {
                // Leaders append an empty entry on election; it only moves
                // the applied index.
                if entry.data.is_empty() {
                    return Ok(());
                }
                let request =
                    RaftCmdRequest::decode(&entry.data).map_err(|e| Error::Corruption {
                        index: entry.index,
                        reason: e.to_string(),
                    })?;
                if request.is_admin() {
                    self.process_admin(entry, request)
                } else {
                    self.process_request(entry, request, wb)
                }
            }
        }
    }

    fn process_request(
        &mut self,
        entry: &Entry,
        request: RaftCmdRequest,
        wb: &mut WriteBatch,
    ) -> Result<()> {
        for req in &request.requests {
            match req {
                Request::Put { cf, key, value } => {
                    tracing::debug!(
                        region = self.peer.region_id(),
                        cf = %cf,
                        key = ?key,
                        "apply put"
                    );
                    wb.put(keys::key_with_cf(cf, key), value.clone());
                }
                Request::Delete { cf, key } => {
                    tracing::debug!(
                        region = self.peer.region_id(),
                        cf = %cf,
                        key = ?key,
                        "apply delete"
                    );
                    wb.delete(keys::key_with_cf(cf, key));
                }
                Request::Get { .. } => {
                    // The response must observe writes staged by this very
                    // entry, so everything up to here commits now and the
                    // batch starts over.
                    self.commit_apply_batch(std::mem::take(wb), entry.index, entry.term)?;
                }
                Request::Snap => {}
            }
        }

        let kv = self.peer.raft_group.store().engines().kv.clone();
        let region = self.peer.region().clone();
        let header_epoch = request.header.region_epoch;
        let requests = request.requests;
        Self::handle_proposal(&mut self.peer.proposals, entry, move || {
            let mut resp = RaftCmdResponse::default();
            for req in &requests {
                let payload = match req {
                    Request::Get { cf, key } => Response::Get {
                        value: kv.get(&keys::key_with_cf(cf, key))?,
                    },
                    Request::Put { .. } => Response::Put,
                    Request::Delete { .. } => Response::Delete,
                    Request::Snap => {
                        if is_epoch_stale(&header_epoch, &region.epoch) {
                            return Err(Error::EpochNotMatch {
                                region_id: region.id,
                                current: region.epoch,
                            });
                        }
                        Response::Snap {
                            region: region.clone(),
                        }
                    }
                };
                resp.responses.push(payload);
            }
            Ok(resp)
        });
        Ok(())
    }

    /// Admin entries other than membership changes have no state-machine
    /// effect yet; they complete with their mirror response.
    fn process_admin(&mut self, entry: &Entry, request: RaftCmdRequest) -> Result<()> {
        let admin = match request.admin_request {
            Some(admin) => admin,
            None => return Ok(()),
        };
        let resp = match admin {
            AdminRequest::Split { split_key } => {
                tracing::debug!(
                    region = self.peer.region_id(),
                    ?split_key,
                    "split entry ignored, not supported yet"
                );
                AdminResponse::Split
            }
            AdminRequest::CompactLog { compact_index, .. } => {
                tracing::debug!(
                    region = self.peer.region_id(),
                    compact_index,
                    "compact-log entry ignored, not supported yet"
                );
                AdminResponse::CompactLog
            }
            AdminRequest::TransferLeader { .. } => AdminResponse::TransferLeader,
            AdminRequest::ChangePeer { .. } => {
                // Membership changes travel as ConfChange entries; a Normal
                // entry carrying one is a stale artifact.
                tracing::warn!(
                    region = self.peer.region_id(),
                    index = entry.index,
                    "change-peer in normal entry ignored"
                );
                return Ok(());
            }
        };
        Self::handle_proposal(&mut self.peer.proposals, entry, move || {
            Ok(RaftCmdResponse {
                responses: Vec::new(),
                admin_response: Some(resp),
            })
        });
        Ok(())
    }

    fn process_conf_change(
        &mut self,
        entry: &Entry,
        cc: &ConfChange,
        wb: &mut WriteBatch,
    ) -> Result<()> {
        let request = RaftCmdRequest::decode(&cc.context).map_err(|e| Error::Corruption {
            index: entry.index,
            reason: format!("conf change context: {e}"),
        })?;
        let mut region = self.peer.region().clone();

        match cc.get_change_type() {
            ConfChangeType::AddNode => {
                if region.peer_by_id(cc.node_id).is_none() {
                    let peer = match &request.admin_request {
                        Some(AdminRequest::ChangePeer { peer, .. }) => peer.clone(),
                        _ => {
                            return Err(Error::Corruption {
                                index: entry.index,
                                reason: "conf change without change-peer request".into(),
                            })
                        }
                    };
                    tracing::info!(
                        region = region.id,
                        peer = peer.id,
                        store = peer.store_id,
                        "adding peer"
                    );
                    region.peers.push(peer.clone());
                    region.epoch.conf_ver += 1;
                    self.persist_conf_change(entry, region, wb)?;
                    self.peer.insert_peer_cache(peer);
                }
            }
            ConfChangeType::RemoveNode => {
                if cc.node_id == self.peer.peer_id() {
                    self.destroy_peer();
                    return Ok(());
                }
                if let Some(pos) = region.peers.iter().position(|p| p.id == cc.node_id) {
                    tracing::info!(region = region.id, peer = cc.node_id, "removing peer");
                    region.peers.remove(pos);
                    region.epoch.conf_ver += 1;
                    self.persist_conf_change(entry, region, wb)?;
                    self.peer.remove_peer_cache(cc.node_id);
                }
            }
            ConfChangeType::AddLearnerNode => {
                tracing::warn!(
                    region = region.id,
                    peer = cc.node_id,
                    "learners are not supported, ignoring"
                );
            }
        }

        self.peer.raft_group.apply_conf_change(cc)?;

        let region = self.peer.region().clone();
        Self::handle_proposal(&mut self.peer.proposals, entry, move || {
            Ok(RaftCmdResponse {
                responses: Vec::new(),
                admin_response: Some(AdminResponse::ChangePeer { region }),
            })
        });
        Ok(())
    }

    /// Commit the membership change: engine write first, then the
    /// in-memory views (peer storage, store meta). An engine failure leaves
    /// every in-memory view untouched.
    fn persist_conf_change(
        &mut self,
        entry: &Entry,
        region: Region,
        wb: &mut WriteBatch,
    ) -> Result<()> {
        wb.put_msg(
            keys::region_state_key(region.id),
            &RegionLocalState {
                state: PeerState::Normal,
                region: region.clone(),
            },
        )?;
        self.commit_apply_batch(std::mem::take(wb), entry.index, entry.term)?;

        self.peer.mut_store().set_region(region.clone());
        let mut meta = self.ctx.store_meta.lock().unwrap();
        meta.regions.insert(region.id, region);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Proposal tracking
    // ------------------------------------------------------------------

    /// Match `entry` against the proposal queue and complete the owning
    /// callback. Proposals the log has moved past are stale; an entry below
    /// the queue front belongs to another leader's term and is not ours to
    /// answer.
    fn handle_proposal(
        proposals: &mut VecDeque<Proposal>,
        entry: &Entry,
        build_resp: impl FnOnce() -> Result<RaftCmdResponse>,
    ) {
        while let Some(proposal) = proposals.pop_front() {
            if proposal.index < entry.index {
                proposal.callback.invoke(Err(Error::StaleCommand));
                continue;
            }
            if proposal.index > entry.index {
                proposals.push_front(proposal);
                return;
            }
            if proposal.term != entry.term {
                proposal.callback.invoke(Err(Error::StaleCommand));
            } else {
                proposal.callback.invoke(build_resp());
            }
            return;
        }
    }

    // ------------------------------------------------------------------
    // Proposal path
    // ------------------------------------------------------------------

    /// Validate and submit a client command. Validation failures complete
    /// the callback synchronously and never touch the log.
    pub fn propose_raft_command(&mut self, request: RaftCmdRequest, cb: Callback) {
        if self.peer.stopped {
            cb.invoke(Err(Error::RegionNotFound(self.peer.region_id())));
            return;
        }
        if let Err(e) = self.pre_propose(&request) {
            tracing::debug!(region = self.peer.region_id(), "rejected proposal: {e}");
            cb.invoke(Err(e));
            return;
        }

        match &request.admin_request {
            Some(AdminRequest::TransferLeader { peer }) => {
                // Leadership transfer is a Raft-level order, not a log entry.
                self.peer.raft_group.transfer_leader(peer.id);
                cb.invoke(Ok(RaftCmdResponse {
                    responses: Vec::new(),
                    admin_response: Some(AdminResponse::TransferLeader),
                }));
            }
            Some(AdminRequest::ChangePeer { .. }) => self.propose_conf_change(request, cb),
            _ => self.propose_normal(request, cb),
        }
    }

    fn propose_normal(&mut self, request: RaftCmdRequest, cb: Callback) {
        let data = match request.encode() {
            Ok(data) => data,
            Err(e) => {
                cb.invoke(Err(e));
                return;
            }
        };
        let index = self.peer.next_proposal_index();
        let term = self.peer.term();
        if let Err(e) = self.peer.raft_group.propose(Vec::new(), data) {
            cb.invoke(Err(e.into()));
            return;
        }
        self.peer.proposals.push_back(Proposal {
            index,
            term,
            callback: cb,
        });
    }

    fn propose_conf_change(&mut self, request: RaftCmdRequest, cb: Callback) {
        let (change_type, peer) = match &request.admin_request {
            Some(AdminRequest::ChangePeer { change_type, peer }) => (*change_type, peer.clone()),
            _ => {
                cb.invoke(Err(Error::InvalidMessage("not a change-peer request".into())));
                return;
            }
        };
        let context = match request.encode() {
            Ok(data) => data,
            Err(e) => {
                cb.invoke(Err(e));
                return;
            }
        };
        let mut cc = ConfChange::default();
        cc.set_change_type(change_type.into());
        cc.node_id = peer.id;
        cc.context = context.into();

        let index = self.peer.next_proposal_index();
        let term = self.peer.term();
        if let Err(e) = self.peer.raft_group.propose_conf_change(Vec::new(), cc) {
            cb.invoke(Err(e.into()));
            return;
        }
        self.peer.proposals.push_back(Proposal {
            index,
            term,
            callback: cb,
        });
    }

    /// Fencing before a command may enter the log; the first failure wins.
    fn pre_propose(&mut self, request: &RaftCmdRequest) -> Result<()> {
        let header = &request.header;
        if header.peer.store_id != self.peer.store_id() {
            return Err(Error::StoreNotMatch {
                to_store_id: header.peer.store_id,
                my_store_id: self.peer.store_id(),
            });
        }
        if !self.peer.is_leader() {
            let leader_id = self.peer.leader_id();
            let leader = if leader_id == raft::INVALID_ID {
                None
            } else {
                self.peer.get_peer_from_cache(leader_id)
            };
            return Err(Error::NotLeader {
                region_id: self.peer.region_id(),
                leader,
            });
        }
        if header.peer.id != self.peer.peer_id() {
            return Err(Error::PeerMismatch {
                request_peer_id: header.peer.id,
                my_peer_id: self.peer.peer_id(),
            });
        }
        if header.term != 0 && self.peer.term() > header.term + 1 {
            return Err(Error::StaleCommand);
        }
        for req in &request.requests {
            if let Some(key) = req.key() {
                check_key_in_region(key, self.peer.region())?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Peer-to-peer message handling
    // ------------------------------------------------------------------

    fn on_raft_msg(&mut self, msg: RaftMessage) -> Result<()> {
        if self.peer.stopped {
            return Ok(());
        }
        if !self.validate_raft_message(&msg) {
            return Ok(());
        }
        if msg.is_tombstone {
            // Our replica was removed; actual GC of data is a separate
            // surface, but stop serving immediately.
            tracing::info!(
                region = self.peer.region_id(),
                peer = self.peer.peer_id(),
                "tombstone received"
            );
            self.destroy_peer();
            return Ok(());
        }
        if !self.check_message(&msg) {
            return Ok(());
        }
        let wire = msg
            .message
            .ok_or_else(|| Error::InvalidMessage("normal message without raft payload".into()))?;
        tracing::trace!(
            region = self.peer.region_id(),
            from = wire.from,
            to = wire.to,
            msg_type = wire.msg_type,
            "step raft message"
        );
        self.peer.raft_group.step(wire.into_raft()?)?;
        Ok(())
    }

    /// Messages for a peer this store does not host are misrouted.
    fn validate_raft_message(&self, msg: &RaftMessage) -> bool {
        if msg.to_peer.store_id != self.peer.store_id() {
            tracing::warn!(
                region = self.peer.region_id(),
                to_store = msg.to_peer.store_id,
                my_store = self.peer.store_id(),
                "misrouted message, dropping"
            );
            return false;
        }
        true
    }

    /// Epoch fencing. Returns whether the message may be stepped.
    ///
    /// Stale votes are ignored outright. Stale non-vote traffic from a
    /// store that left the region gets a tombstone reply so the sender can
    /// GC its replica.
    fn check_message(&self, msg: &RaftMessage) -> bool {
        let current = self.peer.region().epoch;
        if !is_epoch_stale(&msg.region_epoch, &current) {
            return true;
        }
        let is_vote = msg.message.as_ref().map(|m| m.is_vote()).unwrap_or(false);
        if is_vote {
            tracing::debug!(
                region = self.peer.region_id(),
                from = msg.from_peer.id,
                "ignoring vote with stale epoch"
            );
            return false;
        }
        let sender_still_member = self
            .peer
            .region()
            .peers
            .iter()
            .any(|p| p.store_id == msg.from_peer.store_id);
        if !sender_still_member {
            self.handle_stale_msg(msg, current, true);
        }
        false
    }

    /// Reply to a departed peer so it learns to remove itself.
    fn handle_stale_msg(&self, msg: &RaftMessage, current_epoch: RegionEpoch, need_gc: bool) {
        if !need_gc {
            return;
        }
        tracing::info!(
            region = msg.region_id,
            to = msg.from_peer.id,
            "sending tombstone to stale peer"
        );
        self.ctx.trans.send(RaftMessage {
            region_id: msg.region_id,
            from_peer: msg.to_peer.clone(),
            to_peer: msg.from_peer.clone(),
            region_epoch: current_epoch,
            kind: RaftMsgKind::Normal,
            message: None,
            data: Vec::new(),
            is_tombstone: true,
        });
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn destroy_peer(&mut self) {
        self.peer.destroy();
        let mut meta = self.ctx.store_meta.lock().unwrap();
        meta.regions.remove(&self.peer.region_id());
    }
}
