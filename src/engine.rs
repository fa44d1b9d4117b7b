//! The write-ahead engine: the `Database` handle and the active-segment
//! writer.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use fs2::FileExt;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::batch::Batch;
use crate::config::DbOptions;
use crate::dir;
use crate::error::{Error, Result};
use crate::index::KeyIndex;
use crate::iterator::DbIterator;
use crate::record::{Record, RecordPointer, RecordType};
use crate::recovery;
use crate::segment::{ActiveSegment, SealedSegment};

/// Point-in-time counters surfaced by `Database::stats`.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub key_count: usize,
    pub disk_bytes: u64,
    pub reclaimable_bytes: u64,
}

pub(crate) struct WriterState {
    pub active: ActiveSegment,
}

pub(crate) struct Shared {
    pub dir_path: PathBuf,
    pub options: DbOptions,
    pub index: Box<dyn KeyIndex>,
    pub writer: RwLock<WriterState>,
    pub sealed: RwLock<HashMap<u64, Arc<SealedSegment>>>,
    pub reclaimable_bytes: AtomicU64,
    pub disk_bytes: AtomicU64,
    pub next_file_id: AtomicU64,
    pub txn_seq: AtomicU64,
    pub closed: AtomicBool,
    pub merge_lock: Mutex<()>,
    pub lock_file: File,
}

impl Shared {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::DbClosed);
        }
        Ok(())
    }

    /// Writes a single encoded record through the writer lock, rolling
    /// to a new active segment if the current one has no room. Returns
    /// the pointer the record was written at.
    pub(crate) fn write_record(&self, record: &Record) -> Result<RecordPointer> {
        let encoded = record.encode();
        if encoded.len() as u64 > self.options.max_file_size {
            return Err(Error::RecordTooLarge(encoded.len() as u64));
        }

        let mut writer = self.writer.write();
        if encoded.len() as u64 > writer.active.remaining() {
            self.roll_segment(&mut writer)?;
        }
        let offset = writer.active.append(&encoded)?;
        if self.options.sync_writes {
            writer.active.sync()?;
        }
        self.disk_bytes.fetch_add(encoded.len() as u64, Ordering::Relaxed);

        Ok(RecordPointer {
            file_id: writer.active.file_id,
            offset,
            record_size: encoded.len() as u64,
        })
    }

    fn roll_segment(&self, writer: &mut WriterState) -> Result<()> {
        let sealed_file_id = writer.active.file_id;
        let new_file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let new_active = ActiveSegment::create(&self.dir_path, new_file_id, self.options.max_file_size)?;
        let old_active = std::mem::replace(&mut writer.active, new_active);
        let sealed = old_active.seal()?;
        debug!("sealed active segment file_id={sealed_file_id}");
        self.sealed.write().insert(sealed_file_id, Arc::new(sealed));
        Ok(())
    }

    pub(crate) fn next_txn_seq(&self) -> u64 {
        self.txn_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Applies an index update for a freshly written record, crediting
    /// the pointer it displaced (if any) to the reclaimable-bytes counter.
    pub(crate) fn apply_index_update(&self, key: Vec<u8>, pointer: RecordPointer) {
        if let Some(previous) = self.index.put(key, pointer) {
            self.reclaimable_bytes
                .fetch_add(previous.record_size, Ordering::Relaxed);
        }
    }

    pub(crate) fn apply_index_removal(&self, key: &[u8]) {
        if let Some(previous) = self.index.remove(key) {
            self.reclaimable_bytes
                .fetch_add(previous.record_size, Ordering::Relaxed);
        }
    }

    /// Reads the record at `pointer`, from whichever segment currently
    /// holds it (the active segment or a sealed one).
    pub(crate) fn read_pointer(&self, pointer: RecordPointer) -> Result<Record> {
        let writer = self.writer.read();
        if pointer.file_id == writer.active.file_id {
            let bytes = writer
                .active
                .read_bytes(pointer.offset, pointer.record_size)?;
            let (record, _) = Record::decode(bytes)?;
            return Ok(record);
        }
        drop(writer);

        let sealed_map = self.sealed.read();
        let sealed = sealed_map
            .get(&pointer.file_id)
            .ok_or(Error::IndexCorruption {
                file_id: pointer.file_id,
                offset: pointer.offset,
            })?;
        let bytes = sealed.read_bytes(pointer.offset, pointer.record_size)?;
        let (record, _) = Record::decode(bytes)?;
        Ok(record)
    }
}

/// A handle to an open database. Cheaply cloneable; every clone shares
/// the same underlying state, with a single logical writer and any
/// number of concurrent readers.
#[derive(Clone)]
pub struct Database {
    pub(crate) shared: Arc<Shared>,
}

impl Database {
    pub fn open(options: DbOptions) -> Result<Self> {
        options.validate()?;
        dir::ensure_dir(&options.dir_path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir::lock_file_path(&options.dir_path))
            .map_err(Error::from_io)?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| Error::DbInUse(options.dir_path.clone()))?;

        let recovered = recovery::recover(&options)?;

        let shared = Arc::new(Shared {
            dir_path: options.dir_path.clone(),
            options,
            index: recovered.index,
            writer: RwLock::new(WriterState {
                active: recovered.active,
            }),
            sealed: RwLock::new(recovered.sealed),
            reclaimable_bytes: AtomicU64::new(recovered.reclaimable_bytes),
            disk_bytes: AtomicU64::new(recovered.disk_bytes),
            next_file_id: AtomicU64::new(recovered.next_file_id),
            // Batch commits number themselves from 1; `0` is reserved for
            // standalone (non-batch) writes.
            txn_seq: AtomicU64::new(recovered.txn_seq_hwm.max(0) + 1),
            closed: AtomicBool::new(false),
            merge_lock: Mutex::new(()),
            lock_file,
        });

        Ok(Database { shared })
    }

    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<()> {
        self.shared.check_open()?;
        let key = key.into();
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let value = value.into();
        // `0` marks a standalone write: it is its own commit point, not
        // part of a batch, so recovery never requires a trailing
        // `TXN_COMMIT` for it.
        let record = Record::normal(key.clone(), value, 0);
        let pointer = self.shared.write_record(&record)?;
        self.shared.apply_index_update(key, pointer);
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.shared.check_open()?;
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let pointer = self.shared.index.get(key).ok_or(Error::KeyNotFound)?;
        let record = self.shared.read_pointer(pointer)?;
        if record.kind == RecordType::Tombstone {
            return Err(Error::KeyNotFound);
        }
        Ok(record.value)
    }

    /// Removes `key`. Idempotent: deleting a key that is already absent
    /// succeeds silently rather than erroring.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.shared.check_open()?;
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        if self.shared.index.get(key).is_none() {
            return Ok(());
        }
        let record = Record::tombstone(key.to_vec(), 0);
        self.shared.write_record(&record)?;
        self.shared.apply_index_removal(key);
        Ok(())
    }

    pub fn list_keys(&self) -> Result<Vec<Vec<u8>>> {
        self.shared.check_open()?;
        Ok(self.shared.index.ordered_keys())
    }

    pub fn iter(&self) -> Result<DbIterator> {
        self.shared.check_open()?;
        Ok(DbIterator::new(self.shared.clone(), None, false))
    }

    pub fn iter_prefix(&self, prefix: impl Into<Vec<u8>>) -> Result<DbIterator> {
        self.shared.check_open()?;
        Ok(DbIterator::new(self.shared.clone(), Some(prefix.into()), false))
    }

    pub fn batch(&self) -> Result<Batch> {
        self.shared.check_open()?;
        Ok(Batch::new(self.shared.clone()))
    }

    pub fn merge(&self) -> Result<()> {
        self.shared.check_open()?;
        crate::merge::run(&self.shared)
    }

    pub fn sync(&self) -> Result<()> {
        self.shared.check_open()?;
        self.shared.writer.read().active.sync()
    }

    pub fn stats(&self) -> Result<Stats> {
        self.shared.check_open()?;
        Ok(Stats {
            key_count: self.shared.index.len(),
            disk_bytes: self.shared.disk_bytes.load(Ordering::Relaxed),
            reclaimable_bytes: self.shared.reclaimable_bytes.load(Ordering::Relaxed),
        })
    }

    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.writer.read().active.sync()?;
        self.shared.lock_file.unlock().map_err(Error::from_io)?;
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if Arc::strong_count(&self.shared) == 1 {
            if let Err(e) = self.close() {
                warn!("error closing database on drop: {e}");
            }
        }
    }
}
