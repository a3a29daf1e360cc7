//! Self-describing properties blocks of the two checkpoint file types.
//!
//! Each block is `[u32 count][PropertyEntry]...`, one entry per named field.
//! Readers fill the fields they know and skip the rest, so a field added
//! later does not break an older reader.

use tracing::trace;

use crate::block::{BlockHandle, PropertyEntry};
use crate::encoding::{Decode, Encode, EncodingError, decode_vec, encode_vec};

/// Property name of the generation id.
pub const PROP_FILE_ID: &str = "fileid";

/// Property name of the record (key file) or value (value file) count.
pub const PROP_COUNT: &str = "count";

/// Property name of the key file's data region.
pub const PROP_KEYS_HANDLE: &str = "keys";

/// Property name of the value file's data region.
pub const PROP_VALUES_HANDLE: &str = "values";

// ------------------------------------------------------------------------------------------------
// Key file
// ------------------------------------------------------------------------------------------------

/// Metadata of a [`KeyCheckpointFile`](super::KeyCheckpointFile).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFileProperties {
    pub file_id: u32,
    pub key_count: u64,
    pub keys_handle: BlockHandle,
}

impl Encode for KeyFileProperties {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let entries = [
            PropertyEntry::new(PROP_FILE_ID, &self.file_id)?,
            PropertyEntry::new(PROP_COUNT, &self.key_count)?,
            PropertyEntry::new(PROP_KEYS_HANDLE, &self.keys_handle)?,
        ];
        encode_vec(&entries, buf)
    }
}

impl Decode for KeyFileProperties {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (entries, consumed) = decode_vec::<PropertyEntry>(buf)?;
        let mut props = Self::default();
        for entry in &entries {
            match entry.name.as_str() {
                PROP_FILE_ID => props.file_id = entry.value_as()?,
                PROP_COUNT => props.key_count = entry.value_as()?,
                PROP_KEYS_HANDLE => props.keys_handle = entry.value_as()?,
                other => trace!(name = other, "skipping unknown key file property"),
            }
        }
        Ok((props, consumed))
    }
}

// ------------------------------------------------------------------------------------------------
// Value file
// ------------------------------------------------------------------------------------------------

/// Metadata of a [`ValueCheckpointFile`](super::ValueCheckpointFile).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueFileProperties {
    pub file_id: u32,
    pub value_count: u64,
    pub values_handle: BlockHandle,
}

impl Encode for ValueFileProperties {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let entries = [
            PropertyEntry::new(PROP_FILE_ID, &self.file_id)?,
            PropertyEntry::new(PROP_COUNT, &self.value_count)?,
            PropertyEntry::new(PROP_VALUES_HANDLE, &self.values_handle)?,
        ];
        encode_vec(&entries, buf)
    }
}

impl Decode for ValueFileProperties {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (entries, consumed) = decode_vec::<PropertyEntry>(buf)?;
        let mut props = Self::default();
        for entry in &entries {
            match entry.name.as_str() {
                PROP_FILE_ID => props.file_id = entry.value_as()?,
                PROP_COUNT => props.value_count = entry.value_as()?,
                PROP_VALUES_HANDLE => props.values_handle = entry.value_as()?,
                other => trace!(name = other, "skipping unknown value file property"),
            }
        }
        Ok((props, consumed))
    }
}
