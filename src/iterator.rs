//! The key/value iterator.
//!
//! The key set is frozen at construction time — a snapshot of
//! `KeyIndex::ordered_keys` — while each value is resolved against the
//! live index as the cursor advances. A key deleted after the iterator
//! was built is skipped rather than erroring; a key overwritten after
//! construction yields its newest value.

use std::sync::Arc;

use crate::engine::Shared;
use crate::error::Result;
use crate::record::RecordType;

pub struct DbIterator {
    shared: Arc<Shared>,
    keys: Vec<Vec<u8>>,
    reverse: bool,
    pos: usize,
}

impl DbIterator {
    pub(crate) fn new(shared: Arc<Shared>, prefix: Option<Vec<u8>>, reverse: bool) -> Self {
        let mut keys = shared.index.ordered_keys();
        if let Some(prefix) = &prefix {
            keys.retain(|k| k.starts_with(prefix.as_slice()));
        }
        if reverse {
            keys.reverse();
        }
        DbIterator {
            shared,
            keys,
            reverse,
            pos: 0,
        }
    }

    pub fn reversed(mut self) -> Self {
        self.keys.reverse();
        self.reverse = !self.reverse;
        self.pos = 0;
        self
    }

    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Positions the cursor at the first remaining key matching `key`'s
    /// direction (the first key `>= key` when iterating forward, the
    /// first key `<= key` when iterating in reverse).
    pub fn seek(&mut self, key: &[u8]) {
        self.pos = if self.reverse {
            self.keys.iter().position(|k| k.as_slice() <= key)
        } else {
            self.keys.iter().position(|k| k.as_slice() >= key)
        }
        .unwrap_or(self.keys.len());
    }

    pub fn valid(&self) -> bool {
        self.pos < self.keys.len()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.keys.get(self.pos).map(|k| k.as_slice())
    }

    /// The current key's live value, or `None` if it was deleted since
    /// the iterator was constructed.
    pub fn value(&self) -> Option<Result<Vec<u8>>> {
        let key = self.keys.get(self.pos)?;
        self.resolve(key).transpose()
    }

    fn resolve(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let pointer = match self.shared.index.get(key) {
            Some(p) => p,
            None => return Ok(None),
        };
        let record = self.shared.read_pointer(pointer)?;
        if record.kind == RecordType::Tombstone {
            return Ok(None);
        }
        Ok(Some(record.value))
    }
}

impl Iterator for DbIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.valid() {
            let key = self.keys[self.pos].clone();
            self.pos += 1;
            match self.resolve(&key) {
                Ok(Some(value)) => return Some(Ok((key, value))),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use crate::config::DbOptions;
    use crate::engine::Database;

    #[test]
    fn iterates_in_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(DbOptions::new(dir.path())).unwrap();
        db.put("b", "2").unwrap();
        db.put("a", "1").unwrap();
        db.put("c", "3").unwrap();

        let items: Vec<_> = db.iter().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(
            items,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn skips_keys_deleted_after_construction() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(DbOptions::new(dir.path())).unwrap();
        db.put("a", "1").unwrap();
        db.put("b", "2").unwrap();

        let iter = db.iter().unwrap();
        db.delete(b"a").unwrap();
        let items: Vec<_> = iter.collect::<Result<_, _>>().unwrap();
        assert_eq!(items, vec![(b"b".to_vec(), b"2".to_vec())]);
    }

    #[test]
    fn filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(DbOptions::new(dir.path())).unwrap();
        db.put("user:1", "a").unwrap();
        db.put("user:2", "b").unwrap();
        db.put("order:1", "c").unwrap();

        let items: Vec<_> = db
            .iter_prefix("user:")
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn reversed_iterates_descending() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(DbOptions::new(dir.path())).unwrap();
        db.put("a", "1").unwrap();
        db.put("b", "2").unwrap();

        let items: Vec<_> = db
            .iter()
            .unwrap()
            .reversed()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            items,
            vec![(b"b".to_vec(), b"2".to_vec()), (b"a".to_vec(), b"1".to_vec())]
        );
    }
}
