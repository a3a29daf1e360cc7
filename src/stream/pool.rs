//! Pool of independent read streams over one backing file.
//!
//! Each reader (an enumerator, a value lookup, the metadata read) borrows
//! its own [`FileStream`], so concurrent scans of a sealed checkpoint file
//! never contend on a shared cursor.
//!
//! ## Lifecycle
//!
//! - [`StreamPool::acquire_stream_async`] pops an idle stream or opens a new
//!   one through the [`StreamFactory`]. The returned [`PooledStream`] goes
//!   back to the pool when dropped or passed to
//!   [`StreamPool::release_stream_async`].
//! - [`StreamPool::close_async`] refuses new acquires, waits for acquires
//!   already in flight to finish, then closes every idle stream. Streams
//!   returned after that point are closed instead of pooled.
//!
//! ## Synchronization
//!
//! Idle streams live in a lock-free `SegQueue`. The in-flight acquire count
//! and the `closed` flag are both `SeqCst`, so `close_async` either sees an
//! acquire in flight and waits for it, or the acquire sees `closed` and
//! bails out.

use std::{
    fmt,
    io,
    ops::{Deref, DerefMut},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use crossbeam::queue::SegQueue;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{FileDisposition, FileStream, StreamError};

// ------------------------------------------------------------------------------------------------
// Factory
// ------------------------------------------------------------------------------------------------

/// Opens new streams on demand for a [`StreamPool`].
#[async_trait]
pub trait StreamFactory: Send + Sync + 'static {
    async fn create_stream(&self) -> io::Result<FileStream>;
}

/// Opens read-only streams on an existing file.
#[derive(Debug, Clone)]
pub struct ReadStreamFactory {
    path: PathBuf,
}

impl ReadStreamFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StreamFactory for ReadStreamFactory {
    async fn create_stream(&self) -> io::Result<FileStream> {
        FileStream::open(&self.path, FileDisposition::OpenExisting).await
    }
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

struct PoolShared {
    factory: Box<dyn StreamFactory>,
    idle: SegQueue<FileStream>,
    max_idle: usize,
    closed: AtomicBool,
    acquiring: AtomicUsize,
    acquires_done: Notify,
    opened: AtomicUsize,
}

impl PoolShared {
    /// Return a stream without awaiting. Streams that cannot be pooled are
    /// dropped, which closes the descriptor.
    fn give_back(&self, stream: FileStream) {
        if self.closed.load(Ordering::SeqCst) || self.idle.len() >= self.max_idle {
            return;
        }
        self.idle.push(stream);

        // A close that raced past the check above has already drained.
        if self.closed.load(Ordering::SeqCst) {
            while self.idle.pop().is_some() {}
        }
    }
}

/// Counts an acquire as in flight for as long as it lives.
struct AcquireGuard<'a> {
    shared: &'a PoolShared,
}

impl<'a> AcquireGuard<'a> {
    fn enter(shared: &'a PoolShared) -> Result<Self, StreamError> {
        shared.acquiring.fetch_add(1, Ordering::SeqCst);
        let guard = Self { shared };
        if shared.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        Ok(guard)
    }
}

impl Drop for AcquireGuard<'_> {
    fn drop(&mut self) {
        if self.shared.acquiring.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.acquires_done.notify_waiters();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// StreamPool
// ------------------------------------------------------------------------------------------------

/// A growable pool of read streams keyed to one backing file.
pub struct StreamPool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for StreamPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPool")
            .field("idle", &self.shared.idle.len())
            .field("max_idle", &self.shared.max_idle)
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl StreamPool {
    /// Create a pool that keeps at most `max_idle` streams open while unused.
    pub fn new(factory: impl StreamFactory, max_idle: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                factory: Box::new(factory),
                idle: SegQueue::new(),
                max_idle: max_idle.max(1),
                closed: AtomicBool::new(false),
                acquiring: AtomicUsize::new(0),
                acquires_done: Notify::new(),
                opened: AtomicUsize::new(0),
            }),
        }
    }

    /// Borrow a stream, opening a new one if none is idle.
    ///
    /// The position of a reused stream is whatever its previous borrower
    /// left; callers always seek before reading.
    pub async fn acquire_stream_async(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PooledStream, StreamError> {
        let _in_flight = AcquireGuard::enter(&self.shared)?;

        if let Some(stream) = self.shared.idle.pop() {
            return Ok(PooledStream::new(stream, Arc::clone(&self.shared)));
        }

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            res = self.shared.factory.create_stream() => res?,
        };
        self.shared.opened.fetch_add(1, Ordering::Relaxed);

        if self.shared.closed.load(Ordering::SeqCst) {
            stream.close_async().await?;
            return Err(StreamError::Closed);
        }

        debug!(path = %stream.path().display(), "pool opened new read stream");
        Ok(PooledStream::new(stream, Arc::clone(&self.shared)))
    }

    /// Return a borrowed stream. After the pool closed, the stream is closed
    /// instead.
    pub async fn release_stream_async(&self, stream: PooledStream) -> Result<(), StreamError> {
        stream.release_async().await
    }

    /// Stop handing out streams and close every idle one.
    ///
    /// Waits for in-flight acquires first. Calling it again is a no-op.
    pub async fn close_async(&self) -> Result<(), StreamError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        loop {
            let done = self.shared.acquires_done.notified();
            if self.shared.acquiring.load(Ordering::SeqCst) == 0 {
                break;
            }
            done.await;
        }

        let mut first_err = None;
        let mut closed = 0usize;
        while let Some(stream) = self.shared.idle.pop() {
            if let Err(e) = stream.close_async().await {
                warn!(error = %e, "failed to close pooled stream");
                first_err.get_or_insert(e);
            }
            closed += 1;
        }

        info!(
            closed,
            opened = self.shared.opened.load(Ordering::Relaxed),
            "stream pool closed"
        );

        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Streams currently parked in the pool.
    pub fn idle_count(&self) -> usize {
        self.shared.idle.len()
    }

    /// Streams opened through the factory over the pool's lifetime.
    pub fn opened_count(&self) -> usize {
        self.shared.opened.load(Ordering::Relaxed)
    }
}

// ------------------------------------------------------------------------------------------------
// PooledStream
// ------------------------------------------------------------------------------------------------

/// A stream borrowed from a [`StreamPool`]; returned to it on drop.
pub struct PooledStream {
    stream: Option<FileStream>,
    shared: Arc<PoolShared>,
}

impl PooledStream {
    fn new(stream: FileStream, shared: Arc<PoolShared>) -> Self {
        Self {
            stream: Some(stream),
            shared,
        }
    }

    async fn release_async(mut self) -> Result<(), StreamError> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        if self.shared.closed.load(Ordering::SeqCst) {
            stream.close_async().await?;
        } else {
            self.shared.give_back(stream);
        }
        Ok(())
    }
}

impl fmt::Debug for PooledStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledStream")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl Deref for PooledStream {
    type Target = FileStream;

    fn deref(&self) -> &FileStream {
        match &self.stream {
            Some(stream) => stream,
            None => unreachable!("pooled stream accessed after release"),
        }
    }
}

impl DerefMut for PooledStream {
    fn deref_mut(&mut self) -> &mut FileStream {
        match &mut self.stream {
            Some(stream) => stream,
            None => unreachable!("pooled stream accessed after release"),
        }
    }
}

impl Drop for PooledStream {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.shared.give_back(stream);
        }
    }
}
