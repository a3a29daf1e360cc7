//! Checkpoint files: the durable snapshot of one store generation.
//!
//! A checkpoint *generation* is a pair of append-only files that share a
//! `file_id`:
//!
//! - [`KeyCheckpointFile`] holds [`KeyRecord`]s in append order.
//! - [`ValueCheckpointFile`] holds the raw value bytes those records point
//!   at through [`BlockHandle`]s.
//!
//! [`CheckpointFile`] bundles the two and is what the store drives.
//!
//! ## Design Overview
//!
//! Both file types share one lifecycle:
//!
//! 1. **Create** a fresh file (`OpenAlways`) for a new generation.
//! 2. **Write** entries. They are staged in a reusable in-memory
//!    [`BinaryWriter`](crate::encoding::BinaryWriter) and handed to the file
//!    stream whenever the buffer passes `write_buffer_size`. These
//!    intermediate writes are not durable.
//! 3. **Flush (seal)** in two phases: write out the staged buffer, then the
//!    properties block, then the footer, then one durable stream flush. A
//!    sealed file is read-only.
//! 4. **Open** an existing file by reading its metadata from the tail, then
//!    enumerate records or read values through pooled read streams.
//!
//! # On-disk layout
//!
//! Key file:
//!
//! ```text
//! [CHUNK_LEN_U32_LE][RECORD][RECORD]...[CHUNK_CRC32_LE]   <- one per buffer flush
//! [CHUNK_LEN_U32_LE][RECORD]...[CHUNK_CRC32_LE]
//! [PROPERTIES {fileid, count, keys}][CHECKSUM_U64_LE]
//! [FOOTER {properties_handle, version}][CHECKSUM_U64_LE]
//! ```
//!
//! Value file:
//!
//! ```text
//! [VALUE_BYTES][VALUE_BYTES]...                           <- raw, addressed by handle
//! [PROPERTIES {fileid, count, values}][CHECKSUM_U64_LE]
//! [FOOTER {properties_handle, version}][CHECKSUM_U64_LE]
//! ```
//!
//! # Concurrency model
//!
//! - One writer per file: every write-path method takes `&mut self`.
//! - Any number of readers once sealed. Enumerators and value reads borrow
//!   independent streams from the file's [`StreamPool`](crate::stream::StreamPool)
//!   and take `&self`.
//!
//! # Guarantees
//!
//! - **All or nothing:** a file is readable only once its footer and the
//!   final flush are on disk. A crash earlier leaves a file whose tail does
//!   not parse, which is reported as [`CheckpointError::CorruptFile`].
//! - **Strict versioning:** footers of any other version are corrupt.
//! - **Scoped release:** pooled streams go back to the pool on every exit
//!   path, and a failed open closes the half-built object before the error
//!   is returned.
//! - **Fatal structure checks:** opening a file that does not exist, or one
//!   shorter than a footer, panics. Those states mean an upstream component
//!   broke its promise that the file was complete.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod key_file;
pub mod pair;
pub mod properties;
pub mod record;
pub mod value_file;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Re-exports
// ------------------------------------------------------------------------------------------------

pub use key_file::{KeyCheckpointEnumerator, KeyCheckpointFile};
pub use pair::{CheckpointFile, key_file_name, parse_file_name, value_file_name};
pub use properties::{KeyFileProperties, ValueFileProperties};
pub use record::{KeyRecord, MAX_KEY_LEN, RecordKind};
pub use value_file::ValueCheckpointFile;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{collections::TryReserveError, io, path::Path};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::block::{self, BlockError, BlockHandle, FileFooter, MIN_FILE_SIZE};
use crate::encoding::{BinaryWriter, Decode, Encode, EncodingError};
use crate::stream::{FileDisposition, FileStream, StreamError, StreamPool};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Extension of key checkpoint files.
pub const KEY_FILE_EXTENSION: &str = "key";

/// Extension of value checkpoint files.
pub const VALUE_FILE_EXTENSION: &str = "val";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by checkpoint file operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The file exists but its contents are not a valid checkpoint.
    #[error("corrupt checkpoint file: {0}")]
    CorruptFile(String),

    /// A buffer or file object could not be allocated.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The call does not fit the file's lifecycle (e.g. writing to a sealed file).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The file or its stream pool has been closed.
    #[error("checkpoint file is closed")]
    Closed,
}

impl From<BlockError> for CheckpointError {
    fn from(e: BlockError) -> Self {
        match e {
            BlockError::Io(e) => Self::Io(e),
            BlockError::Encoding(e) => Self::Encoding(e),
            BlockError::CorruptFile(msg) => Self::CorruptFile(msg),
            BlockError::Cancelled => Self::Cancelled,
        }
    }
}

impl From<StreamError> for CheckpointError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Io(e) => Self::Io(e),
            StreamError::Closed => Self::Closed,
            StreamError::Cancelled => Self::Cancelled,
        }
    }
}

impl From<TryReserveError> for CheckpointError {
    fn from(e: TryReserveError) -> Self {
        Self::ResourceExhausted(e.to_string())
    }
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Tuning for checkpoint file objects.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Staged bytes that trigger a buffer flush to the file stream.
    pub write_buffer_size: usize,

    /// Idle read streams each file's pool keeps open.
    pub max_idle_streams: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 64 * 1024,
            max_idle_streams: 4,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// File lifecycle state
// ------------------------------------------------------------------------------------------------

/// Where a checkpoint file object is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileState {
    /// New file accepting writes; no properties or footer yet.
    Appending,

    /// Existing file opened, metadata not read yet.
    Opened,

    /// Properties and footer present; read-only.
    Sealed,

    /// A write or flush failed part-way; the file must be discarded.
    Failed,
}

impl FileState {
    pub(crate) fn initial(file: &FileStream) -> Self {
        if file.is_writable() {
            Self::Appending
        } else {
            Self::Opened
        }
    }

    pub(crate) fn expect(self, wanted: FileState, op: &str) -> Result<(), CheckpointError> {
        if self != wanted {
            return Err(CheckpointError::InvalidState(format!(
                "{op} requires a {wanted:?} file, found {self:?}"
            )));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Shared helpers
// ------------------------------------------------------------------------------------------------

/// Open (or create) the backing file of a checkpoint.
///
/// `OpenAlways` creates or truncates the file for writing; `OpenExisting`
/// opens it read-only. A failed open leaves no descriptor behind.
pub async fn create_block_file_async(
    path: impl AsRef<Path>,
    disposition: FileDisposition,
) -> Result<FileStream, CheckpointError> {
    let path = path.as_ref();
    let stream = FileStream::open(path, disposition).await?;
    trace!(path = %path.display(), ?disposition, "block file opened");
    Ok(stream)
}

/// Allocate the staging buffer for a file, reporting failure instead of aborting.
pub(crate) fn allocate_buffer(config: &CheckpointConfig) -> Result<BinaryWriter, CheckpointError> {
    Ok(BinaryWriter::with_capacity(config.write_buffer_size)?)
}

/// Phase two of a seal: properties block, footer, durable flush.
///
/// `scratch` must be empty. Returns the properties handle.
pub(crate) async fn write_trailer<P: Encode>(
    stream: &mut FileStream,
    scratch: &mut BinaryWriter,
    properties: &P,
    cancel: &CancellationToken,
) -> Result<BlockHandle, CheckpointError> {
    let properties_handle = block::write_block(stream, scratch, properties, cancel).await?;
    let footer = FileFooter::new(properties_handle);
    block::write_block(stream, scratch, &footer, cancel).await?;

    block::cancellable(cancel, async {
        stream.flush_async().await?;
        Ok::<_, CheckpointError>(())
    })
    .await?;

    debug!(
        path = %stream.path().display(),
        len = stream.position(),
        "checkpoint file trailer written"
    );
    Ok(properties_handle)
}

/// Tail-anchored metadata read.
///
/// Locates the footer from the file length, checks its version, then
/// follows it to the properties block. The pooled stream is returned to the
/// pool on every exit path.
///
/// # Panics
///
/// If the file is shorter than a footer block.
pub(crate) async fn read_trailer<P: Decode>(
    pool: &StreamPool,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<(P, BlockHandle), CheckpointError> {
    let mut stream = pool.acquire_stream_async(cancel).await?;

    let len = stream.length().await?;
    assert!(
        len >= MIN_FILE_SIZE,
        "checkpoint file {} is {len} bytes, shorter than a footer ({MIN_FILE_SIZE})",
        path.display()
    );

    let footer_handle = FileFooter::handle_for_len(len);
    let footer: FileFooter = block::read_block(&mut stream, footer_handle, cancel).await?;
    footer.check_version()?;

    let properties_handle = footer.properties_handle;
    let properties_fits = properties_handle
        .end_offset()
        .and_then(|end| end.checked_add(block::BLOCK_CHECKSUM_SIZE))
        .is_some_and(|end| end <= footer_handle.offset);
    if !properties_fits {
        return Err(CheckpointError::CorruptFile(format!(
            "{}: properties handle {properties_handle:?} overlaps the footer",
            path.display()
        )));
    }

    let properties: P = block::read_block(&mut stream, properties_handle, cancel).await?;
    pool.release_stream_async(stream).await?;

    Ok((properties, properties_handle))
}

/// Check that a data region starts at zero and ends before the properties.
pub(crate) fn check_data_region(
    path: &Path,
    region: BlockHandle,
    properties_handle: BlockHandle,
) -> Result<(), CheckpointError> {
    let fits = region.offset == 0
        && region
            .end_offset()
            .is_some_and(|end| end <= properties_handle.offset);
    if !fits {
        return Err(CheckpointError::CorruptFile(format!(
            "{}: data region {region:?} does not precede properties at {}",
            path.display(),
            properties_handle.offset
        )));
    }
    Ok(())
}
