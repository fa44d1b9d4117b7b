use std::path::PathBuf;

use crate::error::{Error, Result};

/// Which `KeyIndex` implementation backs a database.
///
/// Both variants provide identical semantics; they differ only in
/// memory layout and the constant factor of point operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    /// A `crossbeam_skiplist::SkipMap`-backed ordered index.
    BalancedTree,
    /// A hand-rolled adaptive radix tree, cheaper for long shared key prefixes.
    RadixTree,
}

impl Default for IndexType {
    fn default() -> Self {
        IndexType::BalancedTree
    }
}

/// Configuration recognized at `open()` time.
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Root directory for segments, hint files, the merge marker and the lock file.
    pub dir_path: PathBuf,

    /// Ceiling, in bytes, on the size of any single segment. A record whose
    /// encoded length alone exceeds this is rejected with `RECORD_TOO_LARGE`.
    pub max_file_size: u64,

    /// When `true`, every `put`/`delete`/`batch.commit` calls `sync()` on the
    /// active segment before returning.
    pub sync_writes: bool,

    /// Which `KeyIndex` implementation to construct.
    pub index_type: IndexType,

    /// Threshold for an automatic periodic merge trigger:
    /// `reclaimable_size / disk_size` reaching this ratio. Does not gate
    /// a direct call to `merge()`, which always runs. Must be in `(0, 1]`.
    pub data_file_merge_ratio: f64,

    /// Maximum number of operations a single `Batch` may stage before
    /// `commit()` fails with `BATCH_TOO_LARGE`.
    pub batch_max_size: usize,
}

impl DbOptions {
    /// Starts a builder with the library's defaults, overriding only the
    /// (required) directory path.
    pub fn new(dir_path: impl Into<PathBuf>) -> Self {
        Self {
            dir_path: dir_path.into(),
            max_file_size: 256 * 1024 * 1024,
            sync_writes: false,
            index_type: IndexType::default(),
            data_file_merge_ratio: 0.5,
            batch_max_size: 10_000,
        }
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn index_type(mut self, index_type: IndexType) -> Self {
        self.index_type = index_type;
        self
    }

    pub fn data_file_merge_ratio(mut self, ratio: f64) -> Self {
        self.data_file_merge_ratio = ratio;
        self
    }

    pub fn batch_max_size(mut self, max: usize) -> Self {
        self.batch_max_size = max;
        self
    }

    /// Validates the option set before any directory or file is touched.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_file_size == 0 {
            return Err(Error::InvalidConfig(
                "max_file_size must be greater than zero".into(),
            ));
        }
        if !(self.data_file_merge_ratio > 0.0 && self.data_file_merge_ratio <= 1.0) {
            return Err(Error::InvalidConfig(
                "data_file_merge_ratio must be in (0, 1]".into(),
            ));
        }
        if self.batch_max_size == 0 {
            return Err(Error::InvalidConfig(
                "batch_max_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
