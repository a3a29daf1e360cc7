//! Key records stored in the key checkpoint file.

use crate::block::BlockHandle;
use crate::encoding::{Decode, Encode, EncodingError, MAX_BYTE_LEN, SliceReader};

/// Encoded size of a [`KeyRecord`] without its key bytes: key length,
/// kind, LSN, value handle and value checksum.
pub const KEY_RECORD_OVERHEAD: usize = 4 + 1 + 8 + 16 + 4;

/// Longest key a checkpoint can hold. A single record must fit in one key
/// chunk, and chunks are capped at [`MAX_BYTE_LEN`] on read.
pub const MAX_KEY_LEN: usize = MAX_BYTE_LEN as usize - KEY_RECORD_OVERHEAD;

/// What the last operation on a key left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// First version of the key.
    Inserted,

    /// Overwritten value.
    Updated,

    /// Tombstone. Carries no value; preserves the key's LSN.
    Deleted,
}

impl RecordKind {
    fn tag(self) -> u8 {
        match self {
            RecordKind::Inserted => 0,
            RecordKind::Updated => 1,
            RecordKind::Deleted => 2,
        }
    }

    pub fn is_deleted(self) -> bool {
        self == RecordKind::Deleted
    }
}

impl Encode for RecordKind {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.tag().encode_to(buf)
    }
}

impl Decode for RecordKind {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, n) = u8::decode_from(buf)?;
        let kind = match tag {
            0 => RecordKind::Inserted,
            1 => RecordKind::Updated,
            2 => RecordKind::Deleted,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: u32::from(other),
                    type_name: "RecordKind",
                });
            }
        };
        Ok((kind, n))
    }
}

/// One entry of the key checkpoint file.
///
/// `value` and `value_checksum` locate and verify the value bytes in the
/// paired value file. Deleted records carry [`BlockHandle::EMPTY`] and a
/// zero checksum.
///
/// Wire layout: `[key: u32 len + bytes][kind: u8][lsn: i64][value: handle][value_checksum: u32]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub key: Vec<u8>,
    pub kind: RecordKind,
    pub lsn: i64,
    pub value: BlockHandle,
    pub value_checksum: u32,
}

impl KeyRecord {
    /// Size of this record once encoded.
    pub fn encoded_len(&self) -> usize {
        self.key.len() + KEY_RECORD_OVERHEAD
    }

    /// A tombstone for `key` at `lsn`.
    pub fn tombstone(key: Vec<u8>, lsn: i64) -> Self {
        Self {
            key,
            kind: RecordKind::Deleted,
            lsn,
            value: BlockHandle::EMPTY,
            value_checksum: 0,
        }
    }
}

impl Encode for KeyRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.kind.encode_to(buf)?;
        self.lsn.encode_to(buf)?;
        self.value.encode_to(buf)?;
        self.value_checksum.encode_to(buf)
    }
}

impl Decode for KeyRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut reader = SliceReader::new(buf);
        let record = Self {
            key: reader.read()?,
            kind: reader.read()?,
            lsn: reader.read()?,
            value: reader.read()?,
            value_checksum: reader.read()?,
        };
        if record.kind.is_deleted() && !record.value.is_empty() {
            return Err(EncodingError::Custom(
                "deleted record references a value".into(),
            ));
        }
        Ok((record, reader.offset()))
    }
}
