//! Length limits the checkpoint formats rely on.
//!
//! Key records and properties blocks carry `u32` length and count prefixes.
//! A damaged prefix has to fail before anything is allocated, and the key
//! limit enforced on the write path has to match what the reader accepts.

use crate::block::{BlockHandle, PropertyEntry};
use crate::checkpoint::record::KEY_RECORD_OVERHEAD;
use crate::checkpoint::{KeyFileProperties, KeyRecord, MAX_KEY_LEN, RecordKind};
use crate::encoding::*;

fn record_with_key(key: Vec<u8>) -> KeyRecord {
    KeyRecord {
        key,
        kind: RecordKind::Updated,
        lsn: i64::MAX,
        value: BlockHandle::new(u64::MAX, 7),
        value_checksum: u32::MAX,
    }
}

// ------------------------------------------------------------------------------------------------
// Key records
// ------------------------------------------------------------------------------------------------

#[test]
fn record_overhead_matches_encoding() {
    let empty = record_with_key(Vec::new());
    assert_eq!(encode_to_vec(&empty).unwrap().len(), KEY_RECORD_OVERHEAD);

    let record = record_with_key(b"some key".to_vec());
    assert_eq!(encode_to_vec(&record).unwrap().len(), record.encoded_len());
}

#[test]
fn longest_key_record_fills_one_chunk_exactly() {
    assert_eq!(MAX_KEY_LEN + KEY_RECORD_OVERHEAD, MAX_BYTE_LEN as usize);
}

#[test]
fn key_length_above_limit_is_rejected() {
    let mut buf = (MAX_BYTE_LEN + 1).to_le_bytes().to_vec();
    buf.extend_from_slice(&[0u8; KEY_RECORD_OVERHEAD]);
    let err = decode_from_slice::<KeyRecord>(&buf).unwrap_err();
    assert!(matches!(err, EncodingError::LengthOverflow(_)), "{err:?}");
}

#[test]
fn longest_key_length_needs_its_bytes() {
    let buf = (MAX_KEY_LEN as u32).to_le_bytes();
    let err = decode_from_slice::<KeyRecord>(&buf).unwrap_err();
    assert!(matches!(err, EncodingError::UnexpectedEof { .. }), "{err:?}");
}

// ------------------------------------------------------------------------------------------------
// Properties
// ------------------------------------------------------------------------------------------------

#[test]
fn property_name_length_above_limit_is_rejected() {
    let buf = u32::MAX.to_le_bytes();
    let err = decode_from_slice::<PropertyEntry>(&buf).unwrap_err();
    assert!(matches!(err, EncodingError::LengthOverflow(_)), "{err:?}");
}

#[test]
fn property_count_above_limit_is_rejected() {
    let buf = (MAX_VEC_ELEMENTS + 1).to_le_bytes();
    let err = decode_from_slice::<KeyFileProperties>(&buf).unwrap_err();
    assert!(matches!(err, EncodingError::LengthOverflow(_)), "{err:?}");
}

#[test]
fn property_count_without_entries_is_eof() {
    // Three entries claimed, none present.
    let buf = 3u32.to_le_bytes();
    let err = decode_from_slice::<KeyFileProperties>(&buf).unwrap_err();
    assert!(matches!(err, EncodingError::UnexpectedEof { .. }), "{err:?}");
}
