//! A checkpoint generation: one key file plus one value file.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    CheckpointConfig, CheckpointError, KEY_FILE_EXTENSION, KeyCheckpointEnumerator,
    KeyCheckpointFile, KeyRecord, MAX_KEY_LEN, RecordKind, VALUE_FILE_EXTENSION,
    ValueCheckpointFile,
};
use crate::encoding::EncodingError;
use crate::stream::FileDisposition;

/// File name of the key half of generation `file_id`.
pub fn key_file_name(file_id: u32) -> String {
    format!("{file_id:06}.{KEY_FILE_EXTENSION}")
}

/// File name of the value half of generation `file_id`.
pub fn value_file_name(file_id: u32) -> String {
    format!("{file_id:06}.{VALUE_FILE_EXTENSION}")
}

/// Parse a generation id back out of a checkpoint file name.
///
/// Returns `None` for names that are not checkpoint files.
pub fn parse_file_name(name: &str) -> Option<u32> {
    let (stem, ext) = name.rsplit_once('.')?;
    if ext != KEY_FILE_EXTENSION && ext != VALUE_FILE_EXTENSION {
        return None;
    }
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Both files of one generation, written and read together.
///
/// The value file is sealed before the key file, so a sealed key file
/// always implies its values are durable. A write that fails after its
/// value was staged poisons the pair: it can no longer be sealed.
#[derive(Debug)]
pub struct CheckpointFile {
    file_id: u32,
    keys: KeyCheckpointFile,
    values: ValueCheckpointFile,
    failed: bool,
}

impl CheckpointFile {
    /// Create both files of generation `file_id` in `dir`, truncating any leftovers.
    pub async fn create_async(
        dir: impl AsRef<Path>,
        file_id: u32,
        config: &CheckpointConfig,
    ) -> Result<Self, CheckpointError> {
        let (key_path, value_path) = Self::paths(dir, file_id);

        let mut keys =
            KeyCheckpointFile::create_async(&key_path, file_id, FileDisposition::OpenAlways, config)
                .await?;
        let values = match ValueCheckpointFile::create_async(
            &value_path,
            file_id,
            FileDisposition::OpenAlways,
            config,
        )
        .await
        {
            Ok(values) => values,
            Err(e) => {
                if let Err(close_err) = keys.close_async().await {
                    warn!(file_id, error = %close_err, "close key file after failed create");
                }
                return Err(e);
            }
        };

        Ok(Self {
            file_id,
            keys,
            values,
            failed: false,
        })
    }

    /// Open a sealed generation for reading.
    ///
    /// # Panics
    ///
    /// If either file is missing or shorter than a footer.
    pub async fn open_async(
        dir: impl AsRef<Path>,
        file_id: u32,
        config: &CheckpointConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, CheckpointError> {
        let (key_path, value_path) = Self::paths(dir, file_id);

        let mut values = ValueCheckpointFile::open_async(&value_path, config, cancel).await?;
        let keys = match KeyCheckpointFile::open_async(&key_path, config, cancel).await {
            Ok(keys) => keys,
            Err(e) => {
                if let Err(close_err) = values.close_async().await {
                    warn!(file_id, error = %close_err, "close value file after failed open");
                }
                return Err(e);
            }
        };

        let mut pair = Self {
            file_id,
            keys,
            values,
            failed: false,
        };
        if let Err(e) = pair.check_identity() {
            if let Err(close_err) = pair.close_async().await {
                warn!(file_id, error = %close_err, "close checkpoint after failed open");
            }
            return Err(e);
        }

        info!(
            file_id,
            keys = pair.keys.key_count(),
            values = pair.values.value_count(),
            "checkpoint opened"
        );
        Ok(pair)
    }

    fn check_identity(&self) -> Result<(), CheckpointError> {
        if self.keys.file_id() != self.file_id || self.values.file_id() != self.file_id {
            return Err(CheckpointError::CorruptFile(format!(
                "generation {} holds key file {} and value file {}",
                self.file_id,
                self.keys.file_id(),
                self.values.file_id()
            )));
        }
        Ok(())
    }

    /// Append one key version. `value` must be `None` exactly when `kind` is
    /// [`RecordKind::Deleted`].
    pub async fn write_async(
        &mut self,
        key: &[u8],
        kind: RecordKind,
        lsn: i64,
        value: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> Result<(), CheckpointError> {
        if self.failed {
            return Err(CheckpointError::InvalidState(format!(
                "generation {} failed a previous write",
                self.file_id
            )));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(EncodingError::LengthOverflow(format!(
                "key of {} bytes exceeds MAX_KEY_LEN ({MAX_KEY_LEN})",
                key.len()
            ))
            .into());
        }

        let record = match (kind.is_deleted(), value) {
            (true, None) => KeyRecord::tombstone(key.to_vec(), lsn),
            (false, Some(value)) => {
                let (handle, value_checksum) = self
                    .values
                    .write_value_async(value, cancel)
                    .await
                    .inspect_err(|_| self.failed = true)?;
                KeyRecord {
                    key: key.to_vec(),
                    kind,
                    lsn,
                    value: handle,
                    value_checksum,
                }
            }
            (true, Some(_)) => {
                return Err(CheckpointError::InvalidState(
                    "a deleted record cannot carry a value".into(),
                ));
            }
            (false, None) => {
                return Err(CheckpointError::InvalidState(format!(
                    "a {kind:?} record needs a value"
                )));
            }
        };
        let res = self.keys.write_async(&record, cancel).await;
        if res.is_err() {
            self.failed = true;
        }
        res
    }

    /// Seal the value file, then the key file.
    pub async fn flush_async(&mut self, cancel: &CancellationToken) -> Result<(), CheckpointError> {
        if self.failed {
            return Err(CheckpointError::InvalidState(format!(
                "generation {} cannot be sealed after a failed write",
                self.file_id
            )));
        }
        self.values.flush_async(cancel).await?;
        self.keys.flush_async(cancel).await?;
        debug!(file_id = self.file_id, keys = self.keys.key_count(), "checkpoint sealed");
        Ok(())
    }

    pub async fn enumerate_async(
        &self,
        cancel: &CancellationToken,
    ) -> Result<KeyCheckpointEnumerator, CheckpointError> {
        self.keys.enumerate_async(cancel).await
    }

    /// Fetch the value a record points at. Tombstones have none.
    pub async fn read_value_async(
        &self,
        record: &KeyRecord,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>, CheckpointError> {
        if record.kind.is_deleted() {
            return Ok(None);
        }
        self.values
            .read_value_async(record.value, record.value_checksum, cancel)
            .await
            .map(Some)
    }

    /// Close both files. The value file is closed even if the key file fails to.
    pub async fn close_async(&mut self) -> Result<(), CheckpointError> {
        let keys = self.keys.close_async().await;
        let values = self.values.close_async().await;
        keys?;
        values
    }

    /// Remove both files of generation `file_id`. Missing files are fine.
    pub async fn delete_async(dir: impl AsRef<Path>, file_id: u32) -> Result<(), CheckpointError> {
        let (key_path, value_path) = Self::paths(dir, file_id);
        for path in [key_path, value_path] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "checkpoint file removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Key and value file paths of generation `file_id` under `dir`.
    pub fn paths(dir: impl AsRef<Path>, file_id: u32) -> (PathBuf, PathBuf) {
        let dir = dir.as_ref();
        (
            dir.join(key_file_name(file_id)),
            dir.join(value_file_name(file_id)),
        )
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn key_count(&self) -> u64 {
        self.keys.key_count()
    }

    pub fn value_count(&self) -> u64 {
        self.values.value_count()
    }

    pub fn key_file(&self) -> &KeyCheckpointFile {
        &self.keys
    }

    pub fn value_file(&self) -> &ValueCheckpointFile {
        &self.values
    }
}
