//! Positioned file streams and the read-stream pool.
//!
//! [`FileStream`] is the buffered-file primitive the checkpoint files are
//! written and read through. It keeps its own logical position, so callers
//! express every read and write as "at the current position" and move the
//! cursor explicitly with [`FileStream::set_position`].
//!
//! ## Contract
//!
//! - Writes are visible to later reads on the same stream, but they are not
//!   durable until [`FileStream::flush_async`] completes. A crash before that
//!   point may leave the file length and contents in any intermediate state.
//! - A stream is not shared: at most one operation is outstanding per
//!   instance (`&mut self` on every I/O method). Concurrent readers each hold
//!   their own stream, handed out by a [`StreamPool`].
//!
//! # Sub-modules
//!
//! - [`pool`]: [`StreamPool`], [`PooledStream`] and the [`StreamFactory`] seam.

pub mod pool;

#[cfg(test)]
mod tests;

pub use pool::{PooledStream, ReadStreamFactory, StreamFactory, StreamPool};

use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::trace;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by stream pool operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The pool has been closed; no stream may be handed out or returned.
    #[error("stream pool is closed")]
    Closed,

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
}

// ------------------------------------------------------------------------------------------------
// File disposition
// ------------------------------------------------------------------------------------------------

/// How a backing file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDisposition {
    /// Open for writing a new generation. The file is created if missing;
    /// bytes left behind by an aborted attempt are truncated away.
    OpenAlways,

    /// Open a file that must already exist, read-only.
    OpenExisting,
}

// ------------------------------------------------------------------------------------------------
// FileStream
// ------------------------------------------------------------------------------------------------

/// An async file handle with an explicit logical position.
#[derive(Debug)]
pub struct FileStream {
    file: File,
    path: PathBuf,
    position: u64,
    writable: bool,
}

impl FileStream {
    /// Open `path` with the given disposition.
    pub async fn open(path: impl AsRef<Path>, disposition: FileDisposition) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (file, writable) = match disposition {
            FileDisposition::OpenAlways => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)
                    .await?;
                (file, true)
            }
            FileDisposition::OpenExisting => (File::open(&path).await?, false),
        };

        trace!(path = %path.display(), ?disposition, "file stream opened");

        Ok(Self {
            file,
            path,
            position: 0,
            writable,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the stream was opened for writing.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Current logical position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move the logical position. Takes effect on the next read or write.
    pub fn set_position(&mut self, position: u64) {
        self.position = position;
    }

    /// Current length of the file as reported by the filesystem.
    pub async fn length(&self) -> io::Result<u64> {
        Ok(self.file.metadata().await?.len())
    }

    /// Read into `buf` at the current position until `buf` is full or EOF.
    ///
    /// Returns the number of bytes read; fewer than `buf.len()` means EOF was
    /// reached. Advances the position by that amount.
    pub async fn read_async(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(self.position)).await?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        self.position += filled as u64;
        Ok(filled)
    }

    /// Write all of `buf` at the current position and advance past it.
    pub async fn write_async(&mut self, buf: &[u8]) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "stream was opened read-only",
            ));
        }

        self.file.seek(SeekFrom::Start(self.position)).await?;
        self.file.write_all(buf).await?;
        // Completes the in-flight write before any later seek.
        self.file.flush().await?;

        self.position += buf.len() as u64;
        Ok(())
    }

    /// Durability point: everything written so far reaches stable storage.
    pub async fn flush_async(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        if self.writable {
            self.file.sync_all().await?;
        }
        Ok(())
    }

    /// Close the stream, completing any in-flight operation first.
    ///
    /// Does not sync; callers that need durability call
    /// [`FileStream::flush_async`] before closing.
    pub async fn close_async(mut self) -> io::Result<()> {
        self.file.flush().await?;
        trace!(path = %self.path.display(), "file stream closed");
        Ok(())
    }
}
