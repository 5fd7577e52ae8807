//! Embedded key-value engine using redb.
//!
//! One engine instance backs every region hosted on a store; keys are
//! namespaced by [`crate::keys`]. The engine's one hard requirement is the
//! atomic [`WriteBatch`]: the apply path stages all effects of a run of
//! committed entries plus the advanced apply state into a single batch, and
//! the batch commits as one redb write transaction. A crash either keeps
//! the whole batch or none of it, which is what keeps the applied index
//! truthful.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

const DATA_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("kv_data");

/// Errors from the durable storage layer.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("redb database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("redb transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("protobuf error: {0}")]
    Protobuf(#[from] protobuf::ProtobufError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// One staged operation of a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An ordered list of writes committed atomically by [`KvEngine::write`].
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put { key, value });
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(WriteOp::Delete { key });
    }

    /// Stage a bincode-encoded metadata blob.
    pub fn put_msg<T: Serialize>(&mut self, key: Vec<u8>, value: &T) -> Result<()> {
        self.put(key, bincode::serialize(value)?);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }
}

/// Handle to the store's durable KV state. Cheap to clone.
#[derive(Clone)]
pub struct KvEngine {
    db: Arc<Database>,
}

impl KvEngine {
    /// Open or create the engine at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Database::create(path)?;
        // Open the table once so reads before the first write don't have to
        // special-case a missing table.
        let txn = db.begin_write()?;
        txn.open_table(DATA_TABLE)?;
        txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Open an engine backed by an unnamed temp file (for testing).
    pub fn open_temporary() -> Result<Self> {
        let tmpfile = tempfile::NamedTempFile::new()
            .map_err(|e| EngineError::Storage(redb::StorageError::Io(e)))?;
        let engine = Self::open(tmpfile.path())?;
        // redb owns the file handle; the OS reclaims it on process exit.
        std::mem::forget(tmpfile);
        Ok(engine)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DATA_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    /// Read and decode a bincode-encoded metadata blob.
    pub fn get_msg<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut wb = WriteBatch::new();
        wb.put(key.to_vec(), value.to_vec());
        self.write(wb)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut wb = WriteBatch::new();
        wb.delete(key.to_vec());
        self.write(wb)
    }

    /// Scan `[start, end)` in key order; an empty `end` means unbounded.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DATA_TABLE)?;
        let range = if end.is_empty() {
            table.range(start..)?
        } else {
            table.range(start..end)?
        };
        let mut out = Vec::new();
        for item in range {
            let (k, v) = item?;
            out.push((k.value().to_vec(), v.value().to_vec()));
        }
        Ok(out)
    }

    /// Commit a batch as one atomic write transaction. Ops apply in staging
    /// order, so a delete after a put of the same key wins.
    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DATA_TABLE)?;
            for op in &batch.ops {
                match op {
                    WriteOp::Put { key, value } => {
                        table.insert(key.as_slice(), value.as_slice())?;
                    }
                    WriteOp::Delete { key } => {
                        table.remove(key.as_slice())?;
                    }
                }
            }
        }
        txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_batch_applies_in_order() {
        let engine = KvEngine::open_temporary().unwrap();
        let mut wb = WriteBatch::new();
        wb.put(b"a".to_vec(), b"1".to_vec());
        wb.put(b"b".to_vec(), b"2".to_vec());
        wb.delete(b"a".to_vec());
        engine.write(wb).unwrap();

        assert_eq!(engine.get(b"a").unwrap(), None);
        assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_uncommitted_batch_has_no_effect() {
        let engine = KvEngine::open_temporary().unwrap();
        let mut wb = WriteBatch::new();
        wb.put(b"a".to_vec(), b"1".to_vec());
        drop(wb);
        assert_eq!(engine.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_scan_range() {
        let engine = KvEngine::open_temporary().unwrap();
        for (k, v) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3")] {
            engine.put(k, v).unwrap();
        }
        let mid = engine.scan(b"a", b"c").unwrap();
        assert_eq!(mid.len(), 2);
        assert_eq!(mid[0].0, b"a".to_vec());
        assert_eq!(mid[1].0, b"b".to_vec());

        let open_ended = engine.scan(b"b", b"").unwrap();
        assert_eq!(open_ended.len(), 2);
        assert_eq!(open_ended[1].1, b"3".to_vec());
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        x: u64,
        tag: String,
    }

    #[test]
    fn test_msg_roundtrip() {
        let engine = KvEngine::open_temporary().unwrap();
        let blob = Blob { x: 42, tag: "meta".into() };
        let mut wb = WriteBatch::new();
        wb.put_msg(b"blob".to_vec(), &blob).unwrap();
        engine.write(wb).unwrap();

        let restored: Option<Blob> = engine.get_msg(b"blob").unwrap();
        assert_eq!(restored, Some(blob));
    }
}
