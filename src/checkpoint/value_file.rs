//! Value checkpoint file.
//!
//! The data region is a raw concatenation of value payloads. A value is
//! addressed by the [`BlockHandle`] its key record holds, and verified
//! against the record's CRC32 when read back.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    CheckpointConfig, CheckpointError, FileState, ValueFileProperties, allocate_buffer,
    check_data_region, create_block_file_async, read_trailer, write_trailer,
};
use crate::block::{self, BlockHandle};
use crate::encoding::BinaryWriter;
use crate::stream::{FileDisposition, FileStream, ReadStreamFactory, StreamPool};

/// Append-only file of value payloads for one checkpoint generation.
#[derive(Debug)]
pub struct ValueCheckpointFile {
    path: PathBuf,
    file_id: u32,
    file: Option<FileStream>,
    pool: StreamPool,
    buffer: BinaryWriter,
    properties: ValueFileProperties,
    state: FileState,
    write_buffer_size: usize,
    /// Logical end of the data region, including staged bytes.
    next_offset: u64,
}

impl ValueCheckpointFile {
    /// Bind a new file object to an already-open backing stream. No I/O.
    pub fn create(
        path: impl Into<PathBuf>,
        file_id: u32,
        file: FileStream,
        config: &CheckpointConfig,
    ) -> Result<Self, CheckpointError> {
        let path = path.into();
        let buffer = allocate_buffer(config)?;
        let pool = StreamPool::new(ReadStreamFactory::new(&path), config.max_idle_streams);

        Ok(Self {
            state: FileState::initial(&file),
            properties: ValueFileProperties {
                file_id,
                ..ValueFileProperties::default()
            },
            path,
            file_id,
            file: Some(file),
            pool,
            buffer,
            write_buffer_size: config.write_buffer_size,
            next_offset: 0,
        })
    }

    pub async fn create_async(
        path: impl AsRef<Path>,
        file_id: u32,
        disposition: FileDisposition,
        config: &CheckpointConfig,
    ) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        let file = create_block_file_async(path, disposition).await?;
        let created = Self::create(path, file_id, file, config)?;
        debug!(path = %path.display(), file_id, ?disposition, "value checkpoint file created");
        Ok(created)
    }

    /// Open an existing, sealed value file and read its metadata.
    ///
    /// # Panics
    ///
    /// If the file does not exist, or is shorter than a footer.
    pub async fn open_async(
        path: impl AsRef<Path>,
        config: &CheckpointConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        assert!(
            tokio::fs::try_exists(path).await?,
            "value checkpoint file {} must exist",
            path.display()
        );

        let mut file = Self::create_async(path, 0, FileDisposition::OpenExisting, config).await?;
        if let Err(e) = file.read_metadata_async(cancel).await {
            if let Err(close_err) = file.close_async().await {
                warn!(path = %path.display(), error = %close_err, "close after failed open");
            }
            return Err(e);
        }

        info!(
            path = %path.display(),
            file_id = file.file_id,
            values = file.properties.value_count,
            "value checkpoint file opened"
        );
        Ok(file)
    }

    // --------------------------------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------------------------------

    /// Stage one value and return where it will live, plus its CRC32.
    pub async fn write_value_async(
        &mut self,
        value: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(BlockHandle, u32), CheckpointError> {
        self.state.expect(FileState::Appending, "write")?;

        let handle = BlockHandle::new(self.next_offset, value.len() as u64);
        self.buffer.write_raw(value);
        self.next_offset += value.len() as u64;
        self.properties.value_count += 1;

        if self.buffer.position() >= self.write_buffer_size {
            self.flush_memory_buffer_async(cancel).await?;
        }
        Ok((handle, block::crc32(value)))
    }

    /// Write staged bytes to the stream in one call and reset the buffer.
    pub async fn flush_memory_buffer_async(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), CheckpointError> {
        self.state.expect(FileState::Appending, "buffer flush")?;
        let res = self.write_staged(cancel).await;
        if res.is_err() {
            self.state = FileState::Failed;
        }
        res
    }

    async fn write_staged(&mut self, cancel: &CancellationToken) -> Result<(), CheckpointError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let stream = self.file.as_mut().ok_or(CheckpointError::Closed)?;
        let bytes = self.buffer.as_bytes();
        block::cancellable(cancel, async {
            stream.write_async(bytes).await?;
            Ok::<_, CheckpointError>(())
        })
        .await?;
        self.buffer.reset();
        Ok(())
    }

    /// Seal the file: staged bytes, properties, footer, durable flush.
    pub async fn flush_async(&mut self, cancel: &CancellationToken) -> Result<(), CheckpointError> {
        self.state.expect(FileState::Appending, "flush")?;

        let res = self.seal(cancel).await;
        self.state = match res {
            Ok(()) => FileState::Sealed,
            Err(_) => FileState::Failed,
        };
        res
    }

    async fn seal(&mut self, cancel: &CancellationToken) -> Result<(), CheckpointError> {
        self.write_staged(cancel).await?;

        let stream = self.file.as_mut().ok_or(CheckpointError::Closed)?;
        debug_assert_eq!(stream.position(), self.next_offset);
        self.properties.values_handle = BlockHandle::new(0, stream.position());
        write_trailer(stream, &mut self.buffer, &self.properties, cancel).await?;

        info!(
            path = %self.path.display(),
            file_id = self.file_id,
            values = self.properties.value_count,
            data_bytes = self.properties.values_handle.size,
            "value checkpoint file sealed"
        );
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read path
    // --------------------------------------------------------------------------------------------

    /// Read the footer and properties from the tail of the file.
    pub async fn read_metadata_async(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), CheckpointError> {
        self.state.expect(FileState::Opened, "metadata read")?;

        let (properties, properties_handle) =
            read_trailer::<ValueFileProperties>(&self.pool, &self.path, cancel).await?;
        check_data_region(&self.path, properties.values_handle, properties_handle)?;

        self.file_id = properties.file_id;
        self.next_offset = properties.values_handle.size;
        self.properties = properties;
        self.state = FileState::Sealed;
        Ok(())
    }

    /// Read the value at `handle` and verify it against `checksum`.
    ///
    /// Safe to call from many tasks at once; each read borrows its own stream.
    pub async fn read_value_async(
        &self,
        handle: BlockHandle,
        checksum: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, CheckpointError> {
        self.state.expect(FileState::Sealed, "value read")?;
        if !self.properties.values_handle.contains(&handle) {
            return Err(CheckpointError::CorruptFile(format!(
                "value handle {handle:?} lies outside the values region {:?}",
                self.properties.values_handle
            )));
        }

        let mut value = vec![0u8; handle.size as usize];
        let mut stream = self.pool.acquire_stream_async(cancel).await?;
        stream.set_position(handle.offset);
        let read = {
            let stream = &mut stream;
            let buf = &mut value;
            block::cancellable(cancel, async {
                Ok::<_, CheckpointError>(stream.read_async(buf).await?)
            })
            .await?
        };
        self.pool.release_stream_async(stream).await?;

        if read < value.len() {
            return Err(CheckpointError::CorruptFile(format!(
                "short value read at {}: wanted {} bytes, got {read}",
                handle.offset, handle.size
            )));
        }
        if block::crc32(&value) != checksum {
            return Err(CheckpointError::CorruptFile(format!(
                "value at {} fails its checksum",
                handle.offset
            )));
        }
        Ok(value)
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Close the stream pool and the backing file. Safe to call twice.
    pub async fn close_async(&mut self) -> Result<(), CheckpointError> {
        let pool_res = self.pool.close_async().await;
        let file_res = match self.file.take() {
            Some(file) => file.close_async().await,
            None => return pool_res.map_err(Into::into),
        };
        debug!(path = %self.path.display(), file_id = self.file_id, "value checkpoint file closed");
        pool_res?;
        file_res?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn value_count(&self) -> u64 {
        self.properties.value_count
    }

    pub fn properties(&self) -> &ValueFileProperties {
        &self.properties
    }

    pub fn is_sealed(&self) -> bool {
        self.state == FileState::Sealed
    }
}
