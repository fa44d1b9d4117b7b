//! Merge / compaction.
//!
//! The active segment is sealed at a merge horizon `H`; every live record
//! among the segments with `file_id <= H` is rewritten into a staging
//! directory (`<dir>/merge`) alongside hint files, and a `merge-finished`
//! marker recording `H + 1` is written before cut-over. Cut-over itself is
//! pure filesystem work (rename staging files into the main directory,
//! delete the merged-away originals) so the same routine finishes a merge
//! interrupted by a crash, driven only by what's on disk.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::info;

use crate::dir;
use crate::engine::Shared;
use crate::error::{Error, Result};
use crate::record::{self, RecordPointer};
use crate::segment::{data_file_path, hint_file_path, ActiveSegment, SealedSegment};

/// Runs a full merge cycle against a live, open database. Always performs
/// the merge when called — `data_file_merge_ratio` gates an automatic
/// periodic trigger, not a direct call to this function, so a caller who
/// asks for a merge always gets one.
pub(crate) fn run(shared: &Arc<Shared>) -> Result<()> {
    let _guard = shared
        .merge_lock
        .try_lock()
        .ok_or(Error::MergeInProgress)?;

    let merge_dir = dir::merge_dir_path(&shared.dir_path);
    if merge_dir.exists() {
        fs::remove_dir_all(&merge_dir).map_err(Error::from_io)?;
    }
    dir::ensure_dir(&merge_dir)?;

    // Seal the active segment; this becomes the merge horizon H.
    let horizon = {
        let mut writer = shared.writer.write();
        let horizon = writer.active.file_id;
        let new_file_id = shared.next_file_id.fetch_add(1, Ordering::SeqCst);
        let new_active =
            ActiveSegment::create(&shared.dir_path, new_file_id, shared.options.max_file_size)?;
        let old_active = std::mem::replace(&mut writer.active, new_active);
        let sealed = old_active.seal()?;
        shared.sealed.write().insert(horizon, Arc::new(sealed));
        horizon
    };

    let candidates: Vec<u64> = shared
        .sealed
        .read()
        .keys()
        .filter(|id| **id <= horizon)
        .copied()
        .collect();

    // Snapshot which keys currently live in a candidate segment.
    let live: Vec<(Vec<u8>, RecordPointer)> = shared
        .index
        .ordered_keys()
        .into_iter()
        .filter_map(|key| {
            let pointer = shared.index.get(&key)?;
            if pointer.file_id <= horizon {
                Some((key, pointer))
            } else {
                None
            }
        })
        .collect();

    info!(
        "merge: horizon={horizon} candidates={} live_keys={}",
        candidates.len(),
        live.len()
    );

    rewrite_staging(shared, &merge_dir, &live)?;
    write_marker(&merge_dir, horizon + 1)?;

    let finished = finish_cutover(&shared.dir_path)?;

    // Bring the live process's state in sync with the new files, rather
    // than paying for a full re-scan: re-point any key whose captured
    // pointer is still current (a key written again mid-merge is left
    // alone; its newer pointer already refers to a live segment).
    let remap: HashMap<u64, u64> = finished.remapped.into_iter().collect();
    for (key, old_pointer, staging_pointer) in staging_pointers(shared, &merge_dir, &live)? {
        if shared.index.get(&key) == Some(old_pointer) {
            if let Some(&final_id) = remap.get(&staging_pointer.file_id) {
                shared.index.put(
                    key,
                    RecordPointer {
                        file_id: final_id,
                        ..staging_pointer
                    },
                );
            }
        }
    }

    for file_id in &candidates {
        shared.sealed.write().remove(file_id);
    }
    for &final_id in remap.values() {
        let reopened = SealedSegment::open(&shared.dir_path, final_id)?;
        shared.sealed.write().insert(final_id, Arc::new(reopened));
    }

    shared.reclaimable_bytes.store(0, Ordering::Relaxed);
    let disk_bytes = dir::list(&shared.dir_path)?
        .data_file_ids
        .iter()
        .filter_map(|id| fs::metadata(data_file_path(&shared.dir_path, *id)).ok())
        .map(|m| m.len())
        .sum();
    shared.disk_bytes.store(disk_bytes, Ordering::Relaxed);

    Ok(())
}

/// Rewrites every live record into one or more staging data files, and
/// emits a matching hint file per staging data file.
fn rewrite_staging(
    shared: &Shared,
    merge_dir: &Path,
    live: &[(Vec<u8>, RecordPointer)],
) -> Result<()> {
    let mut staging_id = 0u64;
    let mut writer = ActiveSegment::create(merge_dir, staging_id, shared.options.max_file_size)?;
    let mut hint_entries: Vec<(Vec<u8>, RecordPointer)> = Vec::new();

    for (key, old_pointer) in live {
        let record = shared.read_pointer(*old_pointer)?;
        let encoded = record.encode();
        if encoded.len() as u64 > writer.remaining() {
            let sealed = writer.seal()?;
            write_hint_file(merge_dir, sealed.file_id, &hint_entries)?;
            hint_entries.clear();
            staging_id += 1;
            writer = ActiveSegment::create(merge_dir, staging_id, shared.options.max_file_size)?;
        }
        let offset = writer.append(&encoded)?;
        hint_entries.push((
            key.clone(),
            RecordPointer {
                file_id: staging_id,
                offset,
                record_size: encoded.len() as u64,
            },
        ));
    }

    let sealed = writer.seal()?;
    write_hint_file(merge_dir, sealed.file_id, &hint_entries)?;
    Ok(())
}

/// Recomputes, for each live key, the staging pointer it was written at.
/// Re-derives rather than threading state through `rewrite_staging` so the
/// in-process index patch and the on-disk hint files stay provably
/// consistent with each other.
fn staging_pointers(
    shared: &Shared,
    merge_dir: &Path,
    live: &[(Vec<u8>, RecordPointer)],
) -> Result<Vec<(Vec<u8>, RecordPointer, RecordPointer)>> {
    let listing = dir::list(merge_dir)?;
    let mut by_key: HashMap<Vec<u8>, RecordPointer> = HashMap::new();
    for file_id in listing.hint_file_ids {
        for (key, pointer) in read_hint_file(merge_dir, file_id)? {
            by_key.insert(key, pointer);
        }
    }
    Ok(live
        .iter()
        .filter_map(|(key, old_pointer)| {
            by_key
                .get(key)
                .map(|staging_pointer| (key.clone(), *old_pointer, *staging_pointer))
        })
        .collect())
}

fn write_hint_file(dir: &Path, file_id: u64, entries: &[(Vec<u8>, RecordPointer)]) -> Result<()> {
    let mut buf = Vec::new();
    for (key, pointer) in entries {
        record::write_varint(&mut buf, key.len() as u64);
        buf.extend_from_slice(key);
        record::write_varint(&mut buf, pointer.file_id);
        record::write_varint(&mut buf, pointer.offset);
        record::write_varint(&mut buf, pointer.record_size);
    }
    fs::write(hint_file_path(dir, file_id), buf).map_err(Error::from_io)
}

pub(crate) fn read_hint_file(dir: &Path, file_id: u64) -> Result<Vec<(Vec<u8>, RecordPointer)>> {
    let bytes = fs::read(hint_file_path(dir, file_id)).map_err(Error::from_io)?;
    let mut cursor: &[u8] = &bytes;
    let mut entries = Vec::new();
    while !cursor.is_empty() {
        let key_len = record::read_varint(&mut cursor)? as usize;
        if cursor.len() < key_len {
            return Err(Error::CorruptLog(format!(
                "truncated hint file {file_id}"
            )));
        }
        let key = cursor[..key_len].to_vec();
        cursor = &cursor[key_len..];
        let pointer_file_id = record::read_varint(&mut cursor)?;
        let offset = record::read_varint(&mut cursor)?;
        let record_size = record::read_varint(&mut cursor)?;
        entries.push((
            key,
            RecordPointer {
                file_id: pointer_file_id,
                offset,
                record_size,
            },
        ));
    }
    Ok(entries)
}

fn write_marker(merge_dir: &Path, horizon_plus_one: u64) -> Result<()> {
    let mut buf = Vec::new();
    record::write_varint(&mut buf, horizon_plus_one);
    fs::write(dir::merge_finished_path(merge_dir), buf).map_err(Error::from_io)
}

fn read_marker(merge_dir: &Path) -> Result<u64> {
    let bytes = fs::read(dir::merge_finished_path(merge_dir)).map_err(Error::from_io)?;
    let mut cursor: &[u8] = &bytes;
    record::read_varint(&mut cursor)
}

pub(crate) struct FinishedMerge {
    /// `(staging_file_id, final_file_id)` pairs assigned during cut-over.
    pub remapped: Vec<(u64, u64)>,
}

/// Moves every staging data/hint file into `dir_path` under freshly
/// allocated ids, then deletes the originals the merge superseded. Safe
/// to call against a directory whose merge already partially cut over
/// (a prior call moved some files before crashing): files already moved
/// are simply absent from the staging directory the second time around.
pub(crate) fn finish_cutover(dir_path: &Path) -> Result<FinishedMerge> {
    let merge_dir = dir::merge_dir_path(dir_path);
    let horizon_plus_one = read_marker(&merge_dir)?;

    let staging = dir::list(&merge_dir)?;
    let existing = dir::list(dir_path)?;
    let mut next_final_id = existing.data_file_ids.iter().max().copied().unwrap_or(0) + 1;

    let mut remapped = Vec::new();
    for staging_id in staging.data_file_ids {
        let final_id = next_final_id;
        next_final_id += 1;
        fs::rename(
            data_file_path(&merge_dir, staging_id),
            data_file_path(dir_path, final_id),
        )
        .map_err(Error::from_io)?;
        let staging_hint = hint_file_path(&merge_dir, staging_id);
        if staging_hint.exists() {
            fs::rename(staging_hint, hint_file_path(dir_path, final_id)).map_err(Error::from_io)?;
        }
        remapped.push((staging_id, final_id));
    }

    for file_id in existing.data_file_ids.iter().filter(|id| **id < horizon_plus_one) {
        let _ = fs::remove_file(data_file_path(dir_path, *file_id));
        let _ = fs::remove_file(hint_file_path(dir_path, *file_id));
    }

    fs::remove_dir_all(&merge_dir).map_err(Error::from_io)?;
    Ok(FinishedMerge { remapped })
}

/// Called at `open()`, before recovery scans the directory: makes sure a
/// merge interrupted by a crash doesn't leave the directory half-migrated.
pub(crate) fn resume_incomplete(dir_path: &Path) -> Result<()> {
    let merge_dir = dir::merge_dir_path(dir_path);
    if !merge_dir.exists() {
        return Ok(());
    }
    if !dir::merge_finished_path(&merge_dir).exists() {
        // Crashed before the rewrite finished; the original segments are
        // untouched, so the staging work is simply discarded.
        fs::remove_dir_all(&merge_dir).map_err(Error::from_io)?;
        return Ok(());
    }
    finish_cutover(dir_path)?;
    Ok(())
}
