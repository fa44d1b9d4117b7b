//! The "balanced ordered tree" index variant: an ordered, concurrent
//! key-to-pointer map.

use crossbeam_skiplist::SkipMap;

use super::KeyIndex;
use crate::record::RecordPointer;

pub struct SkiplistIndex {
    map: SkipMap<Vec<u8>, RecordPointer>,
}

impl SkiplistIndex {
    pub fn new() -> Self {
        SkiplistIndex {
            map: SkipMap::new(),
        }
    }
}

impl Default for SkiplistIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyIndex for SkiplistIndex {
    fn put(&self, key: Vec<u8>, pointer: RecordPointer) -> Option<RecordPointer> {
        let previous = self.map.get(&key).map(|entry| *entry.value());
        self.map.insert(key, pointer);
        previous
    }

    fn remove(&self, key: &[u8]) -> Option<RecordPointer> {
        self.map.remove(key).map(|entry| *entry.value())
    }

    fn get(&self, key: &[u8]) -> Option<RecordPointer> {
        self.map.get(key).map(|entry| *entry.value())
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn ordered_keys(&self) -> Vec<Vec<u8>> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(offset: u64) -> RecordPointer {
        RecordPointer {
            file_id: 0,
            offset,
            record_size: 1,
        }
    }

    #[test]
    fn put_get_remove_round_trip() {
        let idx = SkiplistIndex::new();
        assert_eq!(idx.put(b"a".to_vec(), ptr(1)), None);
        assert_eq!(idx.get(b"a"), Some(ptr(1)));
        assert_eq!(idx.put(b"a".to_vec(), ptr(2)), Some(ptr(1)));
        assert_eq!(idx.remove(b"a"), Some(ptr(2)));
        assert_eq!(idx.get(b"a"), None);
    }

    #[test]
    fn ordered_keys_are_sorted() {
        let idx = SkiplistIndex::new();
        idx.put(b"banana".to_vec(), ptr(1));
        idx.put(b"apple".to_vec(), ptr(2));
        idx.put(b"cherry".to_vec(), ptr(3));
        assert_eq!(
            idx.ordered_keys(),
            vec![b"apple".to_vec(), b"banana".to_vec(), b"cherry".to_vec()]
        );
    }
}
