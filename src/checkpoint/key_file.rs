//! Key checkpoint file and its record enumerator.
//!
//! Records are staged in memory and written out in checksummed chunks,
//! `[u32 len][records...][u32 crc32]`, one chunk per buffer flush. The
//! enumerator walks the chunks in order and verifies each one before
//! decoding its records, so a torn or bit-flipped chunk is reported as
//! corrupt instead of yielding garbage.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    CheckpointConfig, CheckpointError, FileState, KeyFileProperties, KeyRecord, MAX_KEY_LEN,
    allocate_buffer, check_data_region, create_block_file_async, read_trailer, write_trailer,
};
use crate::block::{self, BlockHandle};
use crate::encoding::{self, BinaryWriter, Decode, EncodingError, MAX_BYTE_LEN};
use crate::stream::{FileDisposition, FileStream, PooledStream, ReadStreamFactory, StreamPool};

/// Bytes of the chunk length prefix.
const CHUNK_HEADER_SIZE: usize = 4;

/// Bytes of the chunk CRC32 trailer.
const CHUNK_TRAILER_SIZE: usize = 4;

// ------------------------------------------------------------------------------------------------
// KeyCheckpointFile
// ------------------------------------------------------------------------------------------------

/// Append-only file of [`KeyRecord`]s for one checkpoint generation.
///
/// Single writer: [`write_async`](Self::write_async) and
/// [`flush_async`](Self::flush_async) take `&mut self`. Once sealed, any
/// number of [`KeyCheckpointEnumerator`]s may scan it concurrently.
#[derive(Debug)]
pub struct KeyCheckpointFile {
    path: PathBuf,
    file_id: u32,
    file: Option<FileStream>,
    pool: StreamPool,
    buffer: BinaryWriter,
    properties: KeyFileProperties,
    state: FileState,
    write_buffer_size: usize,
}

impl KeyCheckpointFile {
    /// Bind a new file object to an already-open backing stream.
    ///
    /// Allocates the staging buffer and the read-stream pool; performs no I/O.
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
            properties: KeyFileProperties {
                file_id,
                ..KeyFileProperties::default()
            },
            path,
            file_id,
            file: Some(file),
            pool,
            buffer,
            write_buffer_size: config.write_buffer_size,
        })
    }

    /// Open the backing file with `disposition` and bind a file object to it.
    pub async fn create_async(
        path: impl AsRef<Path>,
        file_id: u32,
        disposition: FileDisposition,
        config: &CheckpointConfig,
    ) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        let file = create_block_file_async(path, disposition).await?;
        // On failure the stream is dropped here, which closes its descriptor.
        let created = Self::create(path, file_id, file, config)?;
        debug!(path = %path.display(), file_id, ?disposition, "key checkpoint file created");
        Ok(created)
    }

    /// Open an existing, sealed key file and read its metadata.
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
            "key checkpoint file {} must exist",
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
            keys = file.properties.key_count,
            "key checkpoint file opened"
        );
        Ok(file)
    }

    // --------------------------------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------------------------------

    /// Stage one record. Flushes the buffer to the stream when it is full.
    pub async fn write_async(
        &mut self,
        record: &KeyRecord,
        cancel: &CancellationToken,
    ) -> Result<(), CheckpointError> {
        self.state.expect(FileState::Appending, "write")?;
        if record.key.len() > MAX_KEY_LEN {
            return Err(EncodingError::LengthOverflow(format!(
                "key of {} bytes exceeds MAX_KEY_LEN ({MAX_KEY_LEN})",
                record.key.len()
            ))
            .into());
        }

        // A chunk never outgrows what the enumerator accepts.
        let staged = self.buffer.position().saturating_sub(CHUNK_HEADER_SIZE);
        if !self.buffer.is_empty() && staged + record.encoded_len() > MAX_BYTE_LEN as usize {
            self.flush_memory_buffer_async(cancel).await?;
        }

        if let Err(e) = self.stage(record) {
            self.state = FileState::Failed;
            return Err(e);
        }
        self.properties.key_count += 1;

        if self.buffer.position() >= self.write_buffer_size {
            self.flush_memory_buffer_async(cancel).await?;
        }
        Ok(())
    }

    fn stage(&mut self, record: &KeyRecord) -> Result<(), CheckpointError> {
        if self.buffer.is_empty() {
            // Chunk length, back-filled on flush.
            self.buffer.write(&0u32)?;
        }
        self.buffer.write(record)?;
        Ok(())
    }

    /// Write the staged chunk to the stream in one call and reset the buffer.
    ///
    /// Not a durability point. A no-op when nothing is staged.
    pub async fn flush_memory_buffer_async(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), CheckpointError> {
        self.state.expect(FileState::Appending, "buffer flush")?;
        let res = self.write_staged_chunk(cancel).await;
        if res.is_err() {
            self.state = FileState::Failed;
        }
        res
    }

    async fn write_staged_chunk(&mut self, cancel: &CancellationToken) -> Result<(), CheckpointError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let payload = &self.buffer.as_bytes()[CHUNK_HEADER_SIZE..];
        let payload_len = encoding::len_to_u32(payload.len())?;
        let crc = block::crc32(payload);
        self.buffer.patch(0, &payload_len.to_le_bytes())?;
        self.buffer.write(&crc)?;

        let stream = self.file.as_mut().ok_or(CheckpointError::Closed)?;
        let bytes = self.buffer.as_bytes();
        block::cancellable(cancel, async {
            stream.write_async(bytes).await?;
            Ok::<_, CheckpointError>(())
        })
        .await?;

        debug!(file_id = self.file_id, payload_len, "key chunk written");
        self.buffer.reset();
        Ok(())
    }

    /// Seal the file: staged chunk, properties, footer, durable flush.
    ///
    /// After success the file is read-only. After failure it must be
    /// discarded; the generation it belonged to is not recoverable.
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
        self.write_staged_chunk(cancel).await?;

        let stream = self.file.as_mut().ok_or(CheckpointError::Closed)?;
        self.properties.keys_handle = BlockHandle::new(0, stream.position());
        write_trailer(stream, &mut self.buffer, &self.properties, cancel).await?;

        info!(
            path = %self.path.display(),
            file_id = self.file_id,
            keys = self.properties.key_count,
            data_bytes = self.properties.keys_handle.size,
            "key checkpoint file sealed"
        );
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read path
    // --------------------------------------------------------------------------------------------

    /// Read the footer and properties from the tail of the file.
    ///
    /// # Panics
    ///
    /// If the file is shorter than a footer.
    pub async fn read_metadata_async(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), CheckpointError> {
        self.state.expect(FileState::Opened, "metadata read")?;

        let (properties, properties_handle) =
            read_trailer::<KeyFileProperties>(&self.pool, &self.path, cancel).await?;
        check_data_region(&self.path, properties.keys_handle, properties_handle)?;

        self.file_id = properties.file_id;
        self.properties = properties;
        self.state = FileState::Sealed;
        Ok(())
    }

    /// Start a scan of every record in append order.
    ///
    /// The enumerator holds its own pooled stream until dropped.
    pub async fn enumerate_async(
        &self,
        cancel: &CancellationToken,
    ) -> Result<KeyCheckpointEnumerator, CheckpointError> {
        self.state.expect(FileState::Sealed, "enumerate")?;
        let stream = self.pool.acquire_stream_async(cancel).await?;
        Ok(KeyCheckpointEnumerator {
            stream,
            region: self.properties.keys_handle,
            next_chunk: self.properties.keys_handle.offset,
            chunk: Vec::new(),
            cursor: 0,
            yielded: 0,
            expected: self.properties.key_count,
        })
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
        debug!(path = %self.path.display(), file_id = self.file_id, "key checkpoint file closed");
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

    /// Records written so far, or recorded in the properties once sealed.
    pub fn key_count(&self) -> u64 {
        self.properties.key_count
    }

    pub fn properties(&self) -> &KeyFileProperties {
        &self.properties
    }

    pub fn is_sealed(&self) -> bool {
        self.state == FileState::Sealed
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &StreamPool {
        &self.pool
    }
}

// ------------------------------------------------------------------------------------------------
// Enumerator
// ------------------------------------------------------------------------------------------------

/// Sequential reader over the records of a sealed key file.
#[derive(Debug)]
pub struct KeyCheckpointEnumerator {
    stream: PooledStream,
    region: BlockHandle,
    next_chunk: u64,
    chunk: Vec<u8>,
    cursor: usize,
    yielded: u64,
    expected: u64,
}

impl KeyCheckpointEnumerator {
    /// Next record, or `None` once the data region is exhausted.
    pub async fn next_async(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<KeyRecord>, CheckpointError> {
        loop {
            if self.cursor < self.chunk.len() {
                let (record, consumed) = KeyRecord::decode_from(&self.chunk[self.cursor..])
                    .map_err(|e| {
                        CheckpointError::CorruptFile(format!(
                            "undecodable key record in chunk ending at {}: {e}",
                            self.next_chunk
                        ))
                    })?;
                self.cursor += consumed;
                self.yielded += 1;
                return Ok(Some(record));
            }

            let region_end = self.region.offset + self.region.size;
            if self.next_chunk >= region_end {
                if self.yielded != self.expected {
                    return Err(CheckpointError::CorruptFile(format!(
                        "key file lists {} records but holds {}",
                        self.expected, self.yielded
                    )));
                }
                return Ok(None);
            }

            self.load_chunk(region_end, cancel).await?;
        }
    }

    /// Drain the remaining records.
    pub async fn collect_async(
        mut self,
        cancel: &CancellationToken,
    ) -> Result<Vec<KeyRecord>, CheckpointError> {
        let mut records = Vec::new();
        while let Some(record) = self.next_async(cancel).await? {
            records.push(record);
        }
        Ok(records)
    }

    async fn load_chunk(
        &mut self,
        region_end: u64,
        cancel: &CancellationToken,
    ) -> Result<(), CheckpointError> {
        let start = self.next_chunk;
        let mut header = [0u8; CHUNK_HEADER_SIZE];
        self.read_exact_at(start, &mut header, cancel).await?;
        let payload_len = u32::from_le_bytes(header);

        let framed = (CHUNK_HEADER_SIZE + CHUNK_TRAILER_SIZE) as u64 + u64::from(payload_len);
        if payload_len > MAX_BYTE_LEN || start + framed > region_end {
            return Err(CheckpointError::CorruptFile(format!(
                "key chunk at {start} with {payload_len} bytes overruns the data region"
            )));
        }

        let mut body = vec![0u8; payload_len as usize + CHUNK_TRAILER_SIZE];
        self.read_exact_at(start + CHUNK_HEADER_SIZE as u64, &mut body, cancel)
            .await?;
        let trailer = body.split_off(payload_len as usize);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if stored != block::crc32(&body) {
            return Err(CheckpointError::CorruptFile(format!(
                "key chunk at {start} fails its checksum"
            )));
        }

        self.chunk = body;
        self.cursor = 0;
        self.next_chunk = start + framed;
        Ok(())
    }

    async fn read_exact_at(
        &mut self,
        offset: u64,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<(), CheckpointError> {
        let wanted = buf.len();
        self.stream.set_position(offset);
        let stream = &mut self.stream;
        let read = block::cancellable(cancel, async move {
            Ok::<_, CheckpointError>(stream.read_async(buf).await?)
        })
        .await?;
        if read < wanted {
            return Err(CheckpointError::CorruptFile(format!(
                "short read at {offset}: wanted {wanted} bytes, got {read}"
            )));
        }
        Ok(())
    }
}
