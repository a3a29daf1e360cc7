//! The `CHECKPOINT` pointer file.
//!
//! Names the generation recovery should load and the LSN it covers.
//! Replacing it is the commit point of a checkpoint:
//!
//! 1. Write the new contents to `CHECKPOINT.tmp` and `sync_all` it.
//! 2. Rename over `CHECKPOINT`.
//! 3. `fsync` the directory so the rename itself is durable.
//!
//! A crash before step 2 leaves the previous pointer in place; a crash
//! after it leaves the new one. There is no state in between.
//!
//! # On-disk layout
//!
//! ```text
//! [VERSION_U32_LE][FILE_ID_U32_LE][CHECKPOINT_LSN_I64_LE][CRC32_LE]
//! ```
//!
//! The CRC covers every byte before it.

use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::StoreError;
use crate::block;
use crate::encoding::{Encode, SliceReader};

/// File name of the checkpoint pointer.
pub const METADATA_FILE_NAME: &str = "CHECKPOINT";

const TMP_SUFFIX: &str = ".tmp";

/// Format version of the pointer file.
pub const METADATA_VERSION: u32 = 1;

/// The durable record of the current checkpoint generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMetadata {
    pub file_id: u32,
    pub checkpoint_lsn: i64,
}

impl CheckpointMetadata {
    pub fn new(file_id: u32, checkpoint_lsn: i64) -> Self {
        Self {
            file_id,
            checkpoint_lsn,
        }
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(METADATA_FILE_NAME)
    }

    pub fn tmp_path(dir: &Path) -> PathBuf {
        dir.join(format!("{METADATA_FILE_NAME}{TMP_SUFFIX}"))
    }

    pub(crate) fn to_bytes(self) -> Result<Vec<u8>, StoreError> {
        let mut buf = Vec::with_capacity(20);
        METADATA_VERSION.encode_to(&mut buf)?;
        self.file_id.encode_to(&mut buf)?;
        self.checkpoint_lsn.encode_to(&mut buf)?;
        block::crc32(&buf).encode_to(&mut buf)?;
        Ok(buf)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let corrupt = |what: String| StoreError::CorruptFile(format!("{METADATA_FILE_NAME}: {what}"));

        let mut reader = SliceReader::new(bytes);
        let version: u32 = reader.read().map_err(|e| corrupt(e.to_string()))?;
        let file_id: u32 = reader.read().map_err(|e| corrupt(e.to_string()))?;
        let checkpoint_lsn: i64 = reader.read().map_err(|e| corrupt(e.to_string()))?;
        let covered = reader.offset();
        let stored: u32 = reader.read().map_err(|e| corrupt(e.to_string()))?;

        if !reader.is_empty() {
            return Err(corrupt(format!("{} trailing bytes", reader.remaining())));
        }
        if stored != block::crc32(&bytes[..covered]) {
            return Err(corrupt("checksum mismatch".into()));
        }
        if version != METADATA_VERSION {
            return Err(corrupt(format!(
                "unsupported version {version} (expected {METADATA_VERSION})"
            )));
        }

        Ok(Self {
            file_id,
            checkpoint_lsn,
        })
    }

    /// Read the pointer from `dir`. `None` if no checkpoint was ever taken.
    pub async fn load_async(dir: &Path) -> Result<Option<Self>, StoreError> {
        let path = Self::path(dir);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let metadata = Self::from_bytes(&bytes)?;
        debug!(
            file_id = metadata.file_id,
            checkpoint_lsn = metadata.checkpoint_lsn,
            "checkpoint pointer loaded"
        );
        Ok(Some(metadata))
    }

    /// Atomically replace the pointer in `dir`.
    pub async fn store_async(&self, dir: &Path) -> Result<(), StoreError> {
        let bytes = self.to_bytes()?;

        let tmp_path = Self::tmp_path(dir);
        {
            let mut f = tokio::fs::File::create(&tmp_path).await?;
            f.write_all(&bytes).await?;
            f.sync_all().await?;
        }

        let final_path = Self::path(dir);
        tokio::fs::rename(&tmp_path, &final_path).await?;
        fsync_dir(dir).await?;

        info!(
            file_id = self.file_id,
            checkpoint_lsn = self.checkpoint_lsn,
            "checkpoint pointer published"
        );
        Ok(())
    }
}

async fn fsync_dir(dir: &Path) -> io::Result<()> {
    let dir_file = tokio::fs::File::open(dir).await?;
    dir_file.sync_all().await
}
