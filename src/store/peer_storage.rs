//! Durable per-peer state: the Raft log, hard state and region metadata.
//!
//! Two databases back a store. The Raft log and hard state live in their
//! own redb file ([`RaftDb`]), keyed by region so many peers share it. The
//! applied state and region descriptor live in the KV engine, because they
//! must commit atomically with the user-visible effects of applied entries.
//!
//! [`PeerStorage`] stitches both together for one peer and implements
//! `raft::Storage` so the Raft group can read its own log back.

use std::path::Path;
use std::sync::Arc;

use protobuf::Message as PbMessage;
use raft::eraftpb::{Entry, HardState, Snapshot};
use raft::{GetEntriesContext, RaftState, StorageError};
use redb::{Database, ReadableTable, TableDefinition};

use crate::engine::{EngineError, KvEngine, WriteBatch};
use crate::error::Result;
use crate::keys;
use crate::region::{
    conf_state_from_region, ApplyState, PeerState, Region, RegionLocalState, TruncatedState,
};

const LOG_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("raft_log");
const STATE_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_hard_state");

/// `region_id BE ++ index BE` so one table holds every region's log with
/// per-region ordering intact.
fn log_key(region_id: u64, index: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&region_id.to_be_bytes());
    key[8..].copy_from_slice(&index.to_be_bytes());
    key
}

/// Raft log storage shared by all peers of a store.
#[derive(Clone)]
pub struct RaftDb {
    db: Arc<Database>,
}

impl RaftDb {
    pub fn open<P: AsRef<Path>>(path: P) -> crate::engine::Result<Self> {
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        txn.open_table(LOG_TABLE)?;
        txn.open_table(STATE_TABLE)?;
        txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn open_temporary() -> crate::engine::Result<Self> {
        let tmpfile = tempfile::NamedTempFile::new()
            .map_err(|e| EngineError::Storage(redb::StorageError::Io(e)))?;
        let db = Self::open(tmpfile.path())?;
        std::mem::forget(tmpfile);
        Ok(db)
    }

    /// Append entries, truncating any conflicting tail left from a previous
    /// term. One write transaction covers both.
    pub fn append(&self, region_id: u64, entries: &[Entry]) -> crate::engine::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(LOG_TABLE)?;
            let old_last = {
                let lo = log_key(region_id, 0);
                let hi = log_key(region_id, u64::MAX);
                table
                    .range(lo.as_slice()..hi.as_slice())?
                    .next_back()
                    .transpose()?
                    .map(|(k, _)| {
                        let mut idx = [0u8; 8];
                        idx.copy_from_slice(&k.value()[8..]);
                        u64::from_be_bytes(idx)
                    })
            };
            for entry in entries {
                let value = entry.write_to_bytes()?;
                table.insert(log_key(region_id, entry.index).as_slice(), value.as_slice())?;
            }
            let new_last = entries[entries.len() - 1].index;
            if let Some(old_last) = old_last {
                for idx in (new_last + 1)..=old_last {
                    table.remove(log_key(region_id, idx).as_slice())?;
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn entry(&self, region_id: u64, index: u64) -> crate::engine::Result<Option<Entry>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LOG_TABLE)?;
        match table.get(log_key(region_id, index).as_slice())? {
            Some(bytes) => Ok(Some(Entry::parse_from_bytes(bytes.value())?)),
            None => Ok(None),
        }
    }

    /// Index of the newest entry of the region, if any entry exists.
    pub fn last_index(&self, region_id: u64) -> crate::engine::Result<Option<u64>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LOG_TABLE)?;
        let lo = log_key(region_id, 0);
        let hi = log_key(region_id, u64::MAX);
        Ok(table
            .range(lo.as_slice()..hi.as_slice())?
            .next_back()
            .transpose()?
            .map(|(k, _)| {
                let mut idx = [0u8; 8];
                idx.copy_from_slice(&k.value()[8..]);
                u64::from_be_bytes(idx)
            }))
    }

    pub fn hard_state(&self, region_id: u64) -> crate::engine::Result<Option<HardState>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(STATE_TABLE)?;
        match table.get(region_id)? {
            Some(bytes) => Ok(Some(HardState::parse_from_bytes(bytes.value())?)),
            None => Ok(None),
        }
    }

    pub fn set_hard_state(&self, region_id: u64, hs: &HardState) -> crate::engine::Result<()> {
        let value = hs.write_to_bytes()?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(STATE_TABLE)?;
            table.insert(region_id, value.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }
}

/// The two databases of a store.
#[derive(Clone)]
pub struct Engines {
    pub kv: KvEngine,
    pub raft: RaftDb,
}

impl Engines {
    pub fn new(kv: KvEngine, raft: RaftDb) -> Self {
        Self { kv, raft }
    }

    /// Open (or create) both databases under `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> crate::engine::Result<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            kv: KvEngine::open(dir.join("kv.redb"))?,
            raft: RaftDb::open(dir.join("raft.redb"))?,
        })
    }

    pub fn open_temporary() -> crate::engine::Result<Self> {
        Ok(Self {
            kv: KvEngine::open_temporary()?,
            raft: RaftDb::open_temporary()?,
        })
    }
}

/// Result of installing an incoming snapshot, used by the caller to refresh
/// the store-wide region map.
#[derive(Debug)]
pub struct ApplySnapResult {
    pub prev_region: Region,
    pub region: Region,
}

/// Durable state of one peer.
pub struct PeerStorage {
    engines: Engines,
    peer_id: u64,
    region: Region,
    apply_state: ApplyState,
    hard_state: HardState,
    last_index: u64,
    last_term: u64,
}

impl PeerStorage {
    /// Load a peer's durable state, falling back to `region` for a freshly
    /// created replica. A persisted region descriptor wins over the given
    /// one so restarts resume from the last applied membership.
    pub fn new(engines: Engines, region: Region, peer_id: u64) -> Result<Self> {
        let region = match engines
            .kv
            .get_msg::<RegionLocalState>(&keys::region_state_key(region.id))?
        {
            Some(state) => state.region,
            None => region,
        };
        let apply_state = engines
            .kv
            .get_msg::<ApplyState>(&keys::apply_state_key(region.id))?
            .unwrap_or_default();
        let hard_state = engines.raft.hard_state(region.id)?.unwrap_or_default();

        let truncated = apply_state.truncated_state;
        let (last_index, last_term) = match engines.raft.last_index(region.id)? {
            Some(index) => {
                let term = engines
                    .raft
                    .entry(region.id, index)?
                    .map(|e| e.term)
                    .unwrap_or(truncated.term);
                (index, term)
            }
            None => (truncated.index, truncated.term),
        };

        Ok(Self {
            engines,
            peer_id,
            region,
            apply_state,
            hard_state,
            last_index,
            last_term,
        })
    }

    pub fn engines(&self) -> &Engines {
        &self.engines
    }

    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn set_region(&mut self, region: Region) {
        self.region = region;
    }

    pub fn apply_state(&self) -> &ApplyState {
        &self.apply_state
    }

    /// Install a new apply state after its batch committed to the engine.
    pub fn set_apply_state(&mut self, apply_state: ApplyState) {
        debug_assert!(apply_state.applied_index >= self.apply_state.applied_index);
        self.apply_state = apply_state;
    }

    pub fn applied_index(&self) -> u64 {
        self.apply_state.applied_index
    }

    pub fn truncated_index(&self) -> u64 {
        self.apply_state.truncated_state.index
    }

    pub fn truncated_term(&self) -> u64 {
        self.apply_state.truncated_state.term
    }

    fn first_index_impl(&self) -> u64 {
        self.truncated_index() + 1
    }

    fn last_index_impl(&self) -> u64 {
        self.last_index
    }

    /// Persist the durable outputs of a Ready batch: an incoming snapshot,
    /// new log entries, and the hard state, in that order.
    pub fn save_ready_state(&mut self, ready: &raft::Ready) -> Result<Option<ApplySnapResult>> {
        let mut snap_result = None;
        if !ready.snapshot().is_empty() {
            snap_result = Some(self.apply_snapshot(ready.snapshot())?);
        }
        if !ready.entries().is_empty() {
            self.append(ready.entries())?;
        }
        if let Some(hs) = ready.hs() {
            self.engines.raft.set_hard_state(self.region.id, hs)?;
            self.hard_state = hs.clone();
        }
        Ok(snap_result)
    }

    pub fn append(&mut self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.engines.raft.append(self.region.id, entries)?;
        let last = &entries[entries.len() - 1];
        self.last_index = last.index;
        self.last_term = last.term;
        Ok(())
    }

    /// Install an incoming snapshot: fast-forward the log bookkeeping and,
    /// when the snapshot carries a region descriptor, adopt it. Snapshot
    /// generation stays out of scope; this is the receiving half only.
    fn apply_snapshot(&mut self, snap: &Snapshot) -> Result<ApplySnapResult> {
        let meta = snap.get_metadata();
        tracing::info!(
            region = self.region.id,
            peer = self.peer_id,
            index = meta.index,
            term = meta.term,
            "applying snapshot"
        );
        let prev_region = self.region.clone();
        if !snap.get_data().is_empty() {
            let state: RegionLocalState = bincode::deserialize(snap.get_data())?;
            self.region = state.region;
        }

        let apply_state = ApplyState {
            applied_index: meta.index,
            truncated_state: TruncatedState {
                index: meta.index,
                term: meta.term,
            },
        };
        let mut wb = WriteBatch::new();
        wb.put_msg(keys::apply_state_key(self.region.id), &apply_state)?;
        wb.put_msg(
            keys::region_state_key(self.region.id),
            &RegionLocalState {
                state: PeerState::Normal,
                region: self.region.clone(),
            },
        )?;
        self.engines.kv.write(wb)?;

        self.apply_state = apply_state;
        self.last_index = meta.index;
        self.last_term = meta.term;
        Ok(ApplySnapResult {
            prev_region,
            region: self.region.clone(),
        })
    }

    fn check_range(&self, low: u64, high: u64) -> raft::Result<()> {
        if low < self.first_index_impl() {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > self.last_index_impl() + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        Ok(())
    }
}

fn to_raft_error(e: impl std::error::Error + Send + Sync + 'static) -> raft::Error {
    raft::Error::Store(StorageError::Other(Box::new(e)))
}

impl raft::Storage for PeerStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        Ok(RaftState::new(
            self.hard_state.clone(),
            conf_state_from_region(&self.region),
        ))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.check_range(low, high)?;
        let max_size = max_size.into().unwrap_or(u64::MAX);
        let mut entries = Vec::with_capacity((high - low) as usize);
        let mut size: u64 = 0;
        for idx in low..high {
            match self
                .engines
                .raft
                .entry(self.region.id, idx)
                .map_err(to_raft_error)?
            {
                Some(entry) => {
                    let entry_size = entry.compute_size() as u64;
                    // Always return at least one entry.
                    if !entries.is_empty() && size + entry_size > max_size {
                        break;
                    }
                    size += entry_size;
                    entries.push(entry);
                }
                None => return Err(raft::Error::Store(StorageError::Unavailable)),
            }
        }
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        if idx == self.truncated_index() {
            return Ok(self.truncated_term());
        }
        if idx < self.truncated_index() {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if idx == self.last_index {
            return Ok(self.last_term);
        }
        match self
            .engines
            .raft
            .entry(self.region.id, idx)
            .map_err(to_raft_error)?
        {
            Some(entry) => Ok(entry.term),
            None => Err(raft::Error::Store(StorageError::Unavailable)),
        }
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.first_index_impl())
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.last_index_impl())
    }

    fn snapshot(&self, _request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        // This node does not generate snapshots yet; followers that fell
        // behind the truncated log must be caught up by other means.
        Err(raft::Error::Store(
            StorageError::SnapshotTemporarilyUnavailable,
        ))
    }
}
