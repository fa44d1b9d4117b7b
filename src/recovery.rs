//! Rebuilding index and engine state at `open()`.
//!
//! Hint files (if present) load straight into the index. Every data file
//! is still replayed to recover the `txn_seq` high-water mark, to
//! recompute reclaimable bytes for any key a later record superseded,
//! and to discard uncommitted batches (a run of records under a
//! `txn_seq` with no trailing `TXN_COMMIT`); the newest segment's replay
//! additionally truncates at the first corrupt or incomplete tail
//! record.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Arc;

use log::warn;

use crate::config::DbOptions;
use crate::dir;
use crate::error::{Error, Result};
use crate::index::{self, KeyIndex};
use crate::merge;
use crate::record::{RecordPointer, RecordType};
use crate::segment::{data_file_path, ActiveSegment, SealedSegment};

pub(crate) struct Recovered {
    pub index: Box<dyn KeyIndex>,
    pub active: ActiveSegment,
    pub sealed: HashMap<u64, Arc<SealedSegment>>,
    pub disk_bytes: u64,
    pub reclaimable_bytes: u64,
    pub next_file_id: u64,
    pub txn_seq_hwm: u64,
}

pub(crate) fn recover(options: &DbOptions) -> Result<Recovered> {
    merge::resume_incomplete(&options.dir_path)?;

    let listing = dir::list(&options.dir_path)?;
    let index = index::build(options.index_type);
    let hint_ids: HashSet<u64> = listing.hint_file_ids.iter().copied().collect();
    let max_data_id = listing.data_file_ids.iter().copied().max();

    for &file_id in &listing.hint_file_ids {
        for (key, pointer) in merge::read_hint_file(&options.dir_path, file_id)? {
            index.put(key, pointer);
        }
    }

    let mut sealed_segments = HashMap::new();
    let mut disk_bytes = 0u64;
    let mut reclaimable_bytes = 0u64;
    let mut txn_seq_hwm = 0u64;
    let mut active_slot = None;

    for &file_id in &listing.data_file_ids {
        let is_newest = Some(file_id) == max_data_id;
        let path = data_file_path(&options.dir_path, file_id);
        let file_len = fs::metadata(&path).map_err(Error::from_io)?.len();

        if is_newest {
            // The backing file is pre-allocated to `max_file_size`, so its
            // raw length never tells us where the real data ends — read it
            // directly and let replay find the true logical length. This
            // also silently absorbs the zero-filled tail left over from
            // preallocation, which is expected, not corruption.
            let raw = fs::read(&path).map_err(Error::from_io)?;
            let good_len = replay(
                &raw,
                &*index,
                file_id,
                !hint_ids.contains(&file_id),
                &mut txn_seq_hwm,
                &mut reclaimable_bytes,
            );
            if good_len < raw.len() as u64 {
                warn!("segment {file_id} ends with {} unreadable trailing bytes (preallocated slack or a crash mid-write)", raw.len() as u64 - good_len);
            }
            let active = ActiveSegment::open_existing(
                &options.dir_path,
                file_id,
                options.max_file_size,
                good_len,
            )?;
            disk_bytes += active.len();
            active_slot = Some(active);
        } else {
            disk_bytes += file_len;
            let sealed = SealedSegment::open(&options.dir_path, file_id)?;
            let bytes = sealed.read_bytes(0, sealed.len())?.to_vec();
            let good_len = replay(
                &bytes,
                &*index,
                file_id,
                !hint_ids.contains(&file_id),
                &mut txn_seq_hwm,
                &mut reclaimable_bytes,
            );
            if good_len < sealed.len() {
                return Err(Error::CorruptLog(format!(
                    "corrupt record in segment {file_id} at offset {good_len}"
                )));
            }
            sealed_segments.insert(file_id, Arc::new(sealed));
        }
    }

    let active = match active_slot {
        Some(active) => active,
        None => ActiveSegment::create(&options.dir_path, 0, options.max_file_size)?,
    };
    let next_file_id = active.file_id + 1;

    Ok(Recovered {
        index,
        active,
        sealed: sealed_segments,
        disk_bytes,
        reclaimable_bytes,
        next_file_id,
        txn_seq_hwm,
    })
}

/// Replays the records in `bytes` (a whole data file's contents),
/// applying `NORMAL`/`TOMBSTONE` records to `index` only once their
/// enclosing batch's `TXN_COMMIT` has been seen, tracking the highest
/// `txn_seq` observed, and crediting the size of any pointer a replayed
/// record displaces to `reclaimable_bytes` (mirroring
/// `Shared::apply_index_update`/`apply_index_removal` for live writes).
/// Returns the length of the prefix of `bytes` that decoded cleanly (the
/// whole length, unless a corrupt or truncated record was found).
fn replay(
    bytes: &[u8],
    index: &dyn KeyIndex,
    file_id: u64,
    apply_to_index: bool,
    txn_seq_hwm: &mut u64,
    reclaimable_bytes: &mut u64,
) -> u64 {
    use crate::record::Record;

    let mut pos = 0u64;
    let mut pending: HashMap<u64, Vec<(Vec<u8>, RecordType, u64, u64)>> = HashMap::new();

    loop {
        if pos as usize >= bytes.len() {
            break;
        }
        match Record::decode(&bytes[pos as usize..]) {
            Ok((record, record_len)) => {
                *txn_seq_hwm = (*txn_seq_hwm).max(record.txn_seq);
                match record.kind {
                    // `txn_seq == 0` marks a standalone write (outside any
                    // batch): it commits itself and needs no trailing
                    // `TXN_COMMIT`.
                    RecordType::Normal | RecordType::Tombstone if record.txn_seq == 0 => {
                        if apply_to_index {
                            apply_replayed(
                                index,
                                record.key.clone(),
                                record.kind,
                                file_id,
                                pos,
                                record_len,
                                reclaimable_bytes,
                            );
                        }
                    }
                    RecordType::Normal | RecordType::Tombstone => {
                        pending.entry(record.txn_seq).or_default().push((
                            record.key.clone(),
                            record.kind,
                            pos,
                            record_len,
                        ));
                    }
                    RecordType::TxnCommit => {
                        if let Some(ops) = pending.remove(&record.txn_seq) {
                            if apply_to_index {
                                for (key, kind, offset, size) in ops {
                                    apply_replayed(
                                        index,
                                        key,
                                        kind,
                                        file_id,
                                        offset,
                                        size,
                                        reclaimable_bytes,
                                    );
                                }
                            }
                        }
                    }
                }
                pos += record_len;
            }
            Err(_) => {
                // Corrupt or truncated trailing bytes: stop here. The
                // caller decides whether this is tolerated (tail of the
                // newest segment) or fatal (anywhere else).
                return pos;
            }
        }
    }
    pos
}

fn apply_replayed(
    index: &dyn KeyIndex,
    key: Vec<u8>,
    kind: RecordType,
    file_id: u64,
    offset: u64,
    record_size: u64,
    reclaimable_bytes: &mut u64,
) {
    let pointer = RecordPointer {
        file_id,
        offset,
        record_size,
    };
    match kind {
        RecordType::Normal => {
            if let Some(previous) = index.put(key, pointer) {
                *reclaimable_bytes += previous.record_size;
            }
        }
        RecordType::Tombstone => {
            if let Some(previous) = index.remove(&key) {
                *reclaimable_bytes += previous.record_size;
            }
        }
        RecordType::TxnCommit => unreachable!("commit records are not staged as pending ops"),
    }
}
