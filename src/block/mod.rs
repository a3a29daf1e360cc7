//! Block handles, the fixed-size file footer, and checksummed block I/O.
//!
//! This is the leaf format layer shared by both checkpoint file types.
//!
//! ## Design Overview
//!
//! A checkpoint file is a sequence of regions addressed by [`BlockHandle`]s.
//! Metadata is anchored at the tail: the last [`MIN_FILE_SIZE`] bytes are
//! always the [`FileFooter`] block, whose position is computed from the file
//! length alone. The footer points at a properties block, which is
//! self-describing (a list of named [`PropertyEntry`]s) so new fields can be
//! added without breaking older readers.
//!
//! # On-disk layout
//!
//! ```text
//! [DATA REGION .......................................]
//! [PROPERTIES_BYTES][PROPERTIES_CHECKSUM_U64_LE]
//! [FOOTER_BYTES (20)][FOOTER_CHECKSUM_U64_LE]
//! ```
//!
//! Every block written by [`write_block`] is its encoded payload followed by
//! an 8-byte checksum slot. The handle returned describes the payload only.
//! The slot holds the CRC32 of the payload in its high 32 bits and the low
//! 32 bits of the payload length in its low 32 bits.
//!
//! # Guarantees
//!
//! - **Strict versioning:** a footer whose version differs from
//!   [`FILE_VERSION`] is rejected as corrupt. There is no compatibility range.
//! - **Corruption detection:** short reads, checksum mismatches and payloads
//!   that do not decode exactly are all reported as
//!   [`BlockError::CorruptFile`].
//! - **Cancellation:** block I/O races the caller's token; a cancelled
//!   operation returns [`BlockError::Cancelled`] and leaves ownership of the
//!   stream with the caller.


use std::{future::Future, io};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::encoding::{
    self, BinaryWriter, Decode, Encode, EncodingError, MAX_BYTE_LEN, SliceReader,
};
use crate::stream::FileStream;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// The single on-disk format version this implementation reads and writes.
pub const FILE_VERSION: u32 = 1;

/// Width of the checksum slot trailing every block.
pub const BLOCK_CHECKSUM_SIZE: u64 = 8;

/// Serialized size of [`FileFooter`]: a 16-byte handle plus a `u32` version.
pub const FOOTER_SIZE: u64 = 20;

/// Smallest file that can hold a footer block.
pub const MIN_FILE_SIZE: u64 = FOOTER_SIZE + BLOCK_CHECKSUM_SIZE;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by block-level reads and writes.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A value could not be encoded.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The bytes on disk do not form the expected block.
    #[error("corrupt file: {0}")]
    CorruptFile(String),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
}

// ------------------------------------------------------------------------------------------------
// BlockHandle
// ------------------------------------------------------------------------------------------------

/// A contiguous byte range within a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    /// Offset of the first byte.
    pub offset: u64,

    /// Number of bytes.
    pub size: u64,
}

impl BlockHandle {
    /// Zero bytes at offset zero.
    pub const EMPTY: BlockHandle = BlockHandle { offset: 0, size: 0 };

    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Offset one past the last byte, or `None` on overflow.
    pub fn end_offset(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }

    /// Whether `other` lies entirely inside `self`.
    pub fn contains(&self, other: &BlockHandle) -> bool {
        match (self.end_offset(), other.end_offset()) {
            (Some(end), Some(other_end)) => other.offset >= self.offset && other_end <= end,
            _ => false,
        }
    }
}

impl Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)
    }
}

impl Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut reader = SliceReader::new(buf);
        let offset = reader.read()?;
        let size = reader.read()?;
        Ok((Self { offset, size }, reader.offset()))
    }
}

// ------------------------------------------------------------------------------------------------
// FileFooter
// ------------------------------------------------------------------------------------------------

/// Fixed-size trailer anchoring the properties block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFooter {
    pub properties_handle: BlockHandle,
    pub version: u32,
}

impl FileFooter {
    /// Footer for the current [`FILE_VERSION`].
    pub fn new(properties_handle: BlockHandle) -> Self {
        Self {
            properties_handle,
            version: FILE_VERSION,
        }
    }

    /// Handle of the footer payload in a file of `file_len` bytes.
    ///
    /// Callers must have checked `file_len >= MIN_FILE_SIZE`.
    pub fn handle_for_len(file_len: u64) -> BlockHandle {
        BlockHandle::new(file_len - MIN_FILE_SIZE, FOOTER_SIZE)
    }

    /// Reject any version other than [`FILE_VERSION`].
    pub fn check_version(&self) -> Result<(), BlockError> {
        if self.version != FILE_VERSION {
            return Err(BlockError::CorruptFile(format!(
                "unsupported file version {} (expected {FILE_VERSION})",
                self.version
            )));
        }
        Ok(())
    }
}

impl Encode for FileFooter {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.properties_handle.encode_to(buf)?;
        self.version.encode_to(buf)
    }
}

impl Decode for FileFooter {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut reader = SliceReader::new(buf);
        let properties_handle = reader.read()?;
        let version = reader.read()?;
        Ok((
            Self {
                properties_handle,
                version,
            },
            reader.offset(),
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Property entries
// ------------------------------------------------------------------------------------------------

/// One named field of a self-describing properties block.
///
/// The value is the encoding of the field, stored as an opaque byte string
/// so readers can skip names they do not know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyEntry {
    pub name: String,
    pub value: Vec<u8>,
}

impl PropertyEntry {
    /// Encode `value` under `name`.
    pub fn new<T: Encode>(name: &str, value: &T) -> Result<Self, EncodingError> {
        Ok(Self {
            name: name.to_string(),
            value: encoding::encode_to_vec(value)?,
        })
    }

    /// Decode the stored value, which must occupy the entry exactly.
    pub fn value_as<T: Decode>(&self) -> Result<T, EncodingError> {
        encoding::decode_exact(&self.value).map_err(|e| {
            EncodingError::Custom(format!("property '{}' is malformed: {e}", self.name))
        })
    }
}

impl Encode for PropertyEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.name.encode_to(buf)?;
        self.value.encode_to(buf)
    }
}

impl Decode for PropertyEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut reader = SliceReader::new(buf);
        let name = reader.read()?;
        let value = reader.read()?;
        Ok((Self { name, value }, reader.offset()))
    }
}

// ------------------------------------------------------------------------------------------------
// Checksums
// ------------------------------------------------------------------------------------------------

/// Value of the 8-byte checksum slot for `payload`.
pub fn block_checksum(payload: &[u8]) -> u64 {
    let mut hasher = Crc32::new();
    hasher.update(payload);
    (u64::from(hasher.finalize()) << 32) | (payload.len() as u64 & 0xFFFF_FFFF)
}

/// CRC32 of `bytes`, used for chunk framing and value checksums.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(bytes);
    hasher.finalize()
}

// ------------------------------------------------------------------------------------------------
// Block I/O
// ------------------------------------------------------------------------------------------------

/// Race `fut` against `cancel`.
pub(crate) async fn cancellable<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<BlockError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BlockError::Cancelled.into()),
        res = fut => res,
    }
}

/// Serialize `value` and append it, plus its checksum, at the stream's
/// current position.
///
/// `writer` is scratch space; it must be empty on entry and is empty again
/// on return. The returned handle covers the payload, not the checksum.
pub async fn write_block<T: Encode>(
    stream: &mut FileStream,
    writer: &mut BinaryWriter,
    value: &T,
    cancel: &CancellationToken,
) -> Result<BlockHandle, BlockError> {
    debug_assert!(writer.is_empty(), "write_block needs an empty writer");
    writer.reset();

    writer.write(value)?;
    let size = writer.position() as u64;
    let checksum = block_checksum(writer.as_bytes());
    writer.write(&checksum)?;

    let offset = stream.position();
    let res = cancellable(cancel, async {
        stream.write_async(writer.as_bytes()).await?;
        Ok::<_, BlockError>(())
    })
    .await;
    writer.reset();
    res?;

    trace!(offset, size, "block written");
    Ok(BlockHandle::new(offset, size))
}

/// Read and decode the block described by `handle`.
pub async fn read_block<T: Decode>(
    stream: &mut FileStream,
    handle: BlockHandle,
    cancel: &CancellationToken,
) -> Result<T, BlockError> {
    if handle.size > u64::from(MAX_BYTE_LEN) {
        return Err(BlockError::CorruptFile(format!(
            "block at offset {} claims {} bytes",
            handle.offset, handle.size
        )));
    }
    let payload_len = handle.size as usize;
    let mut buf = vec![0u8; payload_len + BLOCK_CHECKSUM_SIZE as usize];

    stream.set_position(handle.offset);
    let read = cancellable(cancel, async {
        Ok::<_, BlockError>(stream.read_async(&mut buf).await?)
    })
    .await?;

    if read < buf.len() {
        return Err(BlockError::CorruptFile(format!(
            "short read at offset {}: wanted {} bytes, got {read}",
            handle.offset,
            buf.len()
        )));
    }

    let (payload, tail) = buf.split_at(payload_len);
    let stored = encoding::decode_exact::<u64>(tail)?;
    if stored != block_checksum(payload) {
        return Err(BlockError::CorruptFile(format!(
            "checksum mismatch for block at offset {}",
            handle.offset
        )));
    }

    encoding::decode_exact(payload).map_err(|e| {
        BlockError::CorruptFile(format!(
            "undecodable block at offset {}: {e}",
            handle.offset
        ))
    })
}
