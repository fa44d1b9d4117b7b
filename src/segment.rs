//! A single append-only data file.
//!
//! The active segment is backed by a growable `memmap2::MmapMut` pre-sized
//! to the configured ceiling; a sealed segment reopens a read-only mmap
//! once its length is fixed. Record framing is entirely self-describing
//! (see `record.rs`), so a segment carries no sidecar offset index.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};

use crate::error::{Error, Result};
use crate::record::Record;

/// An append-only data file. `Active` segments accept writes; `Sealed`
/// segments are read-only and safe to share across reader threads.
pub enum Segment {
    Active(ActiveSegment),
    Sealed(SealedSegment),
}

impl Segment {
    pub fn file_id(&self) -> u64 {
        match self {
            Segment::Active(s) => s.file_id,
            Segment::Sealed(s) => s.file_id,
        }
    }

    /// Logical length: the number of bytes actually written, which may be
    /// smaller than the mmap's reserved capacity for an active segment.
    pub fn len(&self) -> u64 {
        match self {
            Segment::Active(s) => s.len,
            Segment::Sealed(s) => s.len,
        }
    }

    pub fn read_at(&self, offset: u64, size: u64) -> Result<&[u8]> {
        match self {
            Segment::Active(s) => s.read_bytes(offset, size),
            Segment::Sealed(s) => s.read_bytes(offset, size),
        }
    }

    /// Iterates records starting at `offset`. See [`ActiveSegment::iterate_from`].
    pub fn iterate_from(&self, offset: u64) -> SegmentIter<'_> {
        match self {
            Segment::Active(s) => s.iterate_from(offset),
            Segment::Sealed(s) => s.iterate_from(offset),
        }
    }
}

/// Yields `(Record, started_at_offset, encoded_len)` triples. Stops
/// cleanly at EOF; a malformed trailing record surfaces as a single
/// `Err(CorruptRecord)` item and the iterator then ends — the shape
/// recovery's tail-truncation logic expects.
pub struct SegmentIter<'a> {
    data: &'a [u8],
    pos: u64,
    done: bool,
}

impl<'a> SegmentIter<'a> {
    fn new(data: &'a [u8], offset: u64) -> Self {
        SegmentIter {
            data,
            pos: offset,
            done: false,
        }
    }
}

impl<'a> Iterator for SegmentIter<'a> {
    type Item = Result<(Record, u64, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let len = self.data.len() as u64;
        if self.pos >= len {
            self.done = true;
            return None;
        }
        let remaining = &self.data[self.pos as usize..];
        match Record::decode(remaining) {
            Ok((record, record_len)) => {
                let started_at = self.pos;
                self.pos += record_len;
                Some(Ok((record, started_at, record_len)))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// The currently-writable segment.
pub struct ActiveSegment {
    pub file_id: u64,
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    len: u64,
    capacity: u64,
}

impl ActiveSegment {
    /// Creates a brand-new active segment, pre-sizing the backing file
    /// (and its mmap) to `capacity` bytes.
    pub fn create(dir: &Path, file_id: u64, capacity: u64) -> Result<Self> {
        let path = data_file_path(dir, file_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(Error::from_io)?;
        file.set_len(capacity).map_err(Error::from_io)?;
        let mmap = unsafe { MmapMut::map_mut(&file).map_err(Error::from_io)? };
        Ok(ActiveSegment {
            file_id,
            path,
            file,
            mmap,
            len: 0,
            capacity,
        })
    }

    /// Reopens an existing data file as the active segment, with `len`
    /// bytes of already-written content (as determined by recovery).
    pub fn open_existing(dir: &Path, file_id: u64, capacity: u64, len: u64) -> Result<Self> {
        let path = data_file_path(dir, file_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(Error::from_io)?;
        let current_len = file.metadata().map_err(Error::from_io)?.len();
        if current_len < capacity {
            file.set_len(capacity).map_err(Error::from_io)?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file).map_err(Error::from_io)? };
        Ok(ActiveSegment {
            file_id,
            path,
            file,
            mmap,
            len,
            capacity: capacity.max(current_len),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn remaining(&self) -> u64 {
        self.capacity - self.len
    }

    pub fn read_bytes(&self, offset: u64, size: u64) -> Result<&[u8]> {
        read_bytes_from(&self.mmap[..self.len as usize], offset, size)
    }

    pub fn iterate_from(&self, offset: u64) -> SegmentIter<'_> {
        SegmentIter::new(&self.mmap[..self.len as usize], offset)
    }

    /// Appends an encoded record, returning the offset it was written at.
    /// Caller is responsible for checking `remaining()` beforehand.
    pub fn append(&mut self, encoded: &[u8]) -> Result<u64> {
        let offset = self.len;
        let end = offset
            .checked_add(encoded.len() as u64)
            .ok_or_else(|| Error::RecordTooLarge(encoded.len() as u64))?;
        if end > self.capacity {
            return Err(Error::RecordTooLarge(encoded.len() as u64));
        }
        self.mmap[offset as usize..end as usize].copy_from_slice(encoded);
        self.len = end;
        Ok(offset)
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().map_err(Error::from_io)
    }

    /// Seals this segment: flushes, shrinks the backing file down to its
    /// logical length, and reopens it read-only.
    pub fn seal(self) -> Result<SealedSegment> {
        self.sync()?;
        self.file.set_len(self.len).map_err(Error::from_io)?;
        let mmap = if self.len == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&self.file).map_err(Error::from_io)? })
        };
        Ok(SealedSegment {
            file_id: self.file_id,
            path: self.path,
            len: self.len,
            mmap: mmap.unwrap_or_else(|| empty_mmap()),
        })
    }
}

/// A sealed, read-only segment.
pub struct SealedSegment {
    pub file_id: u64,
    path: PathBuf,
    len: u64,
    mmap: Mmap,
}

impl SealedSegment {
    pub fn open(dir: &Path, file_id: u64) -> Result<Self> {
        let path = data_file_path(dir, file_id);
        let file = File::open(&path).map_err(Error::from_io)?;
        let len = file.metadata().map_err(Error::from_io)?.len();
        let mmap = if len == 0 {
            empty_mmap()
        } else {
            unsafe { Mmap::map(&file).map_err(Error::from_io)? }
        };
        Ok(SealedSegment {
            file_id,
            path,
            len,
            mmap,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn read_bytes(&self, offset: u64, size: u64) -> Result<&[u8]> {
        read_bytes_from(&self.mmap[..self.len as usize], offset, size)
    }

    pub fn iterate_from(&self, offset: u64) -> SegmentIter<'_> {
        SegmentIter::new(&self.mmap[..self.len as usize], offset)
    }
}

fn read_bytes_from(data: &[u8], offset: u64, size: u64) -> Result<&[u8]> {
    let start = offset as usize;
    let end = start
        .checked_add(size as usize)
        .ok_or(Error::CorruptRecord(offset))?;
    data.get(start..end).ok_or(Error::CorruptRecord(offset))
}

/// `Mmap::map` refuses zero-length files; a handful of call sites need a
/// harmless placeholder for an empty segment.
fn empty_mmap() -> Mmap {
    memmap2::MmapOptions::new()
        .len(0)
        .map_anon()
        .expect("anonymous zero-length mmap never fails")
        .make_read_only()
        .expect("read-only conversion of a fresh anon mmap never fails")
}

pub fn data_file_path(dir: &Path, file_id: u64) -> PathBuf {
    dir.join(format!("{:020}.data", file_id))
}

pub fn hint_file_path(dir: &Path, file_id: u64) -> PathBuf {
    dir.join(format!("{:020}.hint", file_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    #[test]
    fn appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = ActiveSegment::create(dir.path(), 0, 4096).unwrap();
        let record = Record::normal(b"k".to_vec(), b"v".to_vec(), 0);
        let encoded = record.encode();
        let offset = seg.append(&encoded).unwrap();
        assert_eq!(offset, 0);
        let segment = Segment::Active(seg);
        let bytes = segment.read_at(offset, encoded.len() as u64).unwrap();
        assert_eq!(bytes, &encoded[..]);
    }

    #[test]
    fn rejects_write_past_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = ActiveSegment::create(dir.path(), 0, 8).unwrap();
        let record = Record::normal(b"longkey".to_vec(), b"longvalue".to_vec(), 0);
        let encoded = record.encode();
        assert!(seg.append(&encoded).is_err());
    }

    #[test]
    fn iterates_multiple_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = ActiveSegment::create(dir.path(), 0, 4096).unwrap();
        for i in 0..5u64 {
            let record = Record::normal(format!("k{i}").into_bytes(), b"v".to_vec(), i);
            let encoded = record.encode();
            seg.append(&encoded).unwrap();
        }
        let segment = Segment::Active(seg);
        let items: Vec<_> = segment.iterate_from(0).collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(items.len(), 5);
    }

    #[test]
    fn seal_shrinks_file_to_logical_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = ActiveSegment::create(dir.path(), 0, 4096).unwrap();
        let record = Record::normal(b"k".to_vec(), b"v".to_vec(), 0);
        let encoded = record.encode();
        seg.append(&encoded).unwrap();
        let logical_len = seg.len();
        let sealed = seg.seal().unwrap();
        assert_eq!(sealed.len(), logical_len);
        let on_disk_len = std::fs::metadata(sealed.path()).unwrap().len();
        assert_eq!(on_disk_len, logical_len);
    }
}
