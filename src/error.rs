use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the store.
///
/// Variants are grouped by kind: input errors, state errors, I/O errors
/// and corruption. Callers are expected to match on the variant rather
/// than the message.
#[derive(Error, Debug)]
pub enum Error {
    /// `put` was called with a zero-length key.
    #[error("key must not be empty")]
    EmptyKey,

    /// The encoded record would not fit in an otherwise-empty segment.
    #[error("record of {0} bytes exceeds the segment size ceiling")]
    RecordTooLarge(u64),

    /// A batch accumulated more staged operations than `batch_max_size`.
    #[error("batch exceeds the configured maximum of {0} operations")]
    BatchTooLarge(usize),

    /// `get` found no live record for the key.
    #[error("key not found")]
    KeyNotFound,

    /// An operation was attempted after `close()`.
    #[error("database is closed")]
    DbClosed,

    /// `open()` was called on a directory already locked by another instance.
    #[error("database at {0:?} is already in use")]
    DbInUse(PathBuf),

    /// `merge()` was called while a merge was already running.
    #[error("a merge is already in progress")]
    MergeInProgress,

    /// Underlying I/O failure. Transient; the caller may retry.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A distinguished I/O failure: the filesystem has no space left.
    #[error("disk is full")]
    DiskFull,

    /// A single record's header or CRC did not validate.
    #[error("corrupt record at offset {0}")]
    CorruptRecord(u64),

    /// Corruption found outside the tail of the newest segment; unrecoverable.
    #[error("corrupt log: {0}")]
    CorruptLog(String),

    /// A segment or hint file name did not match the expected pattern.
    #[error("malformed data file name: {0}")]
    MalformedFileName(String),

    /// An option passed to `open()` failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Index lookup returned a pointer whose on-disk key does not match.
    #[error("index/log inconsistency for key at {file_id}:{offset}")]
    IndexCorruption { file_id: u64, offset: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Reinterprets an I/O error as `DiskFull` when the OS reports `ENOSPC`,
    /// otherwise wraps it as a plain `Io` error.
    pub(crate) fn from_io(e: io::Error) -> Error {
        if e.kind() == io::ErrorKind::Other && e.raw_os_error() == Some(28) {
            Error::DiskFull
        } else {
            Error::Io(e)
        }
    }
}
