//! Log record framing.
//!
//! ```text
//! | crc32 (4B) | type (1B) | key_len (varint) | value_len (varint) |
//! | txn_seq (varint) | key | value |
//! ```
//! CRC is computed over everything following the CRC field itself.

use crc32fast::Hasher;
use varint_rs::{VarintReader, VarintWriter};

use crate::error::{Error, Result};

/// A record's kind, stored as a single byte on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Normal = 0,
    Tombstone = 1,
    TxnCommit = 2,
}

impl RecordType {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(RecordType::Normal),
            1 => Ok(RecordType::Tombstone),
            2 => Ok(RecordType::TxnCommit),
            _ => Err(Error::CorruptRecord(0)),
        }
    }
}

/// A single decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordType,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub txn_seq: u64,
}

impl Record {
    pub fn normal(key: Vec<u8>, value: Vec<u8>, txn_seq: u64) -> Self {
        Record {
            kind: RecordType::Normal,
            key,
            value,
            txn_seq,
        }
    }

    pub fn tombstone(key: Vec<u8>, txn_seq: u64) -> Self {
        Record {
            kind: RecordType::Tombstone,
            key,
            value: Vec::new(),
            txn_seq,
        }
    }

    pub fn txn_commit(txn_seq: u64) -> Self {
        Record {
            kind: RecordType::TxnCommit,
            key: Vec::new(),
            value: Vec::new(),
            txn_seq,
        }
    }

    /// Encodes the record deterministically; identical records encode to
    /// identical bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut body: Vec<u8> =
            Vec::with_capacity(1 + 10 + 10 + 10 + self.key.len() + self.value.len());
        body.write_u8_varint(self.kind as u8).ok();
        body.write_usize_varint(self.key.len()).ok();
        body.write_usize_varint(self.value.len()).ok();
        body.write_u64_varint(self.txn_seq).ok();
        body.extend_from_slice(&self.key);
        body.extend_from_slice(&self.value);

        let mut hasher = Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Decodes a record starting at byte `0` of `buf`. `buf` need not be
    /// trimmed to the record's exact length — only a prefix covering the
    /// whole record is required. Returns the record and its total encoded
    /// length (the number of bytes to advance the read cursor by).
    pub fn decode(buf: &[u8]) -> Result<(Record, u64)> {
        if buf.len() < 4 {
            return Err(Error::CorruptRecord(0));
        }
        let stored_crc = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let body = &buf[4..];

        let mut reader = body;
        let kind_byte = reader.read_u8_varint().map_err(|_| Error::CorruptRecord(0))?;
        let kind = RecordType::from_byte(kind_byte)?;
        let key_len = reader.read_usize_varint().map_err(|_| Error::CorruptRecord(0))?;
        let value_len = reader.read_usize_varint().map_err(|_| Error::CorruptRecord(0))?;
        let txn_seq = reader.read_u64_varint().map_err(|_| Error::CorruptRecord(0))?;
        let header_len = body.len() - reader.len();

        let total_body_len = header_len
            .checked_add(key_len)
            .and_then(|n| n.checked_add(value_len))
            .ok_or(Error::CorruptRecord(0))?;
        if body.len() < total_body_len {
            return Err(Error::CorruptRecord(0));
        }

        let key = body[header_len..header_len + key_len].to_vec();
        let value = body[header_len + key_len..total_body_len].to_vec();

        let mut hasher = Hasher::new();
        hasher.update(&body[..total_body_len]);
        if hasher.finalize() != stored_crc {
            return Err(Error::CorruptRecord(0));
        }

        let record = Record {
            kind,
            key,
            value,
            txn_seq,
        };
        Ok((record, (4 + total_body_len) as u64))
    }
}

/// Uniquely identifies a live record in the log: which segment, at what
/// offset, and how many bytes its encoded form occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPointer {
    pub file_id: u64,
    pub offset: u64,
    pub record_size: u64,
}

/// Appends `value` to `out` as a LEB128 varint, via the same
/// `varint-rs` writer trait the record header uses. Shared with
/// `merge.rs`'s hint-file framing.
pub(crate) fn write_varint(out: &mut Vec<u8>, value: u64) {
    out.write_u64_varint(value).expect("Vec<u8> writes never fail");
}

/// Reads one LEB128 varint from the front of `*buf`, advancing `*buf`
/// past the bytes consumed.
pub(crate) fn read_varint(buf: &mut &[u8]) -> Result<u64> {
    buf.read_u64_varint().map_err(|_| Error::CorruptRecord(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_normal_record() {
        let record = Record::normal(b"hello".to_vec(), b"world".to_vec(), 0);
        let encoded = record.encode();
        let (decoded, len) = Record::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(len as usize, encoded.len());
    }

    #[test]
    fn round_trips_empty_value() {
        let record = Record::normal(b"k".to_vec(), Vec::new(), 0);
        let encoded = record.encode();
        let (decoded, _) = Record::decode(&encoded).unwrap();
        assert_eq!(decoded.value, Vec::<u8>::new());
    }

    #[test]
    fn round_trips_tombstone() {
        let record = Record::tombstone(b"gone".to_vec(), 0);
        let encoded = record.encode();
        let (decoded, _) = Record::decode(&encoded).unwrap();
        assert_eq!(decoded.kind, RecordType::Tombstone);
        assert!(decoded.value.is_empty());
    }

    #[test]
    fn round_trips_txn_commit() {
        let record = Record::txn_commit(42);
        let encoded = record.encode();
        let (decoded, _) = Record::decode(&encoded).unwrap();
        assert_eq!(decoded.kind, RecordType::TxnCommit);
        assert_eq!(decoded.txn_seq, 42);
    }

    #[test]
    fn decode_is_deterministic() {
        let record = Record::normal(b"a".to_vec(), b"b".to_vec(), 7);
        assert_eq!(record.encode(), record.encode());
    }

    #[test]
    fn rejects_truncated_header() {
        let record = Record::normal(b"hello".to_vec(), b"world".to_vec(), 0);
        let encoded = record.encode();
        let truncated = &encoded[..encoded.len() - 3];
        assert!(Record::decode(truncated).is_err());
    }

    #[test]
    fn rejects_corrupted_crc() {
        let record = Record::normal(b"hello".to_vec(), b"world".to_vec(), 0);
        let mut encoded = record.encode();
        encoded[0] ^= 0xff;
        assert!(matches!(
            Record::decode(&encoded),
            Err(Error::CorruptRecord(_))
        ));
    }

    #[test]
    fn allows_trailing_garbage_after_record() {
        let record = Record::normal(b"k".to_vec(), b"v".to_vec(), 0);
        let mut encoded = record.encode();
        let record_len = encoded.len();
        encoded.extend_from_slice(b"next-record-bytes");
        let (decoded, len) = Record::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(len as usize, record_len);
    }
}
