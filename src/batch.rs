//! Atomic multi-key batches. A `Batch` stages operations in memory;
//! `commit` writes every staged record under a single `txn_seq`,
//! followed by a `TXN_COMMIT` record that is the batch's linearization
//! point. Recovery discards any batch whose trailing commit record is
//! missing.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::Shared;
use crate::error::{Error, Result};
use crate::record::Record;

#[derive(Clone)]
enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl BatchOp {
    fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put(key, _) => key,
            BatchOp::Delete(key) => key,
        }
    }
}

/// A set of operations staged for atomic commit. Dropping a `Batch`
/// without calling `commit` discards it silently.
///
/// Staging keeps an ordered buffer keyed by first insertion, with
/// last-write-wins per key: restaging an already-staged key overwrites
/// its op in place rather than appending a second one.
pub struct Batch {
    shared: Arc<Shared>,
    ops: Vec<BatchOp>,
    positions: HashMap<Vec<u8>, usize>,
}

impl Batch {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Batch {
            shared,
            ops: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<()> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        self.stage(BatchOp::Put(key, value.into()))
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> Result<()> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        self.stage(BatchOp::Delete(key))
    }

    fn stage(&mut self, op: BatchOp) -> Result<()> {
        if let Some(&pos) = self.positions.get(op.key()) {
            self.ops[pos] = op;
            return Ok(());
        }
        if self.ops.len() >= self.shared.options.batch_max_size {
            return Err(Error::BatchTooLarge(self.shared.options.batch_max_size));
        }
        self.positions.insert(op.key().to_vec(), self.ops.len());
        self.ops.push(op);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Writes every staged operation and the trailing commit record, then
    /// publishes the index updates. A batch with no staged operations is
    /// a no-op.
    pub fn commit(self) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }

        let seq = self.shared.next_txn_seq();
        let mut written = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let record = match op {
                BatchOp::Put(key, value) => Record::normal(key.clone(), value.clone(), seq),
                BatchOp::Delete(key) => Record::tombstone(key.clone(), seq),
            };
            let pointer = self.shared.write_record(&record)?;
            written.push((op.clone(), pointer));
        }
        self.shared.write_record(&Record::txn_commit(seq))?;

        for (op, pointer) in written {
            match op {
                BatchOp::Put(key, _) => self.shared.apply_index_update(key, pointer),
                BatchOp::Delete(key) => self.shared.apply_index_removal(&key),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbOptions;
    use crate::engine::Database;

    #[test]
    fn commit_applies_all_staged_operations() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(DbOptions::new(dir.path())).unwrap();
        db.put("keep", "1").unwrap();

        let mut batch = db.batch().unwrap();
        batch.put("a", "1").unwrap();
        batch.put("b", "2").unwrap();
        batch.delete("keep").unwrap();
        batch.commit().unwrap();

        assert_eq!(db.get(b"a").unwrap(), b"1");
        assert_eq!(db.get(b"b").unwrap(), b"2");
        assert!(db.get(b"keep").is_err());
    }

    #[test]
    fn dropped_batch_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(DbOptions::new(dir.path())).unwrap();
        {
            let mut batch = db.batch().unwrap();
            batch.put("a", "1").unwrap();
        }
        assert!(db.get(b"a").is_err());
    }

    #[test]
    fn rejects_batch_past_configured_max() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(DbOptions::new(dir.path()).batch_max_size(2)).unwrap();
        let mut batch = db.batch().unwrap();
        batch.put("a", "1").unwrap();
        batch.put("b", "1").unwrap();
        assert!(matches!(
            batch.put("c", "1"),
            Err(Error::BatchTooLarge(_))
        ));
    }

    #[test]
    fn restaging_a_key_keeps_only_the_last_write() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(DbOptions::new(dir.path())).unwrap();

        let mut batch = db.batch().unwrap();
        batch.put("a", "1").unwrap();
        batch.put("b", "1").unwrap();
        batch.put("a", "2").unwrap();
        assert_eq!(batch.len(), 2);
        batch.commit().unwrap();

        assert_eq!(db.get(b"a").unwrap(), b"2");
        assert_eq!(db.get(b"b").unwrap(), b"1");
    }

    #[test]
    fn restaging_does_not_count_twice_against_the_batch_cap() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(DbOptions::new(dir.path()).batch_max_size(2)).unwrap();
        let mut batch = db.batch().unwrap();
        batch.put("a", "1").unwrap();
        batch.put("a", "2").unwrap();
        batch.put("b", "1").unwrap();
        assert!(matches!(
            batch.put("c", "1"),
            Err(Error::BatchTooLarge(_))
        ));
    }
}
