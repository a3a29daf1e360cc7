//! # tstore
//!
//! The durability core of a transactional key-value store: checkpoint
//! files, the apply state machine, and crash recovery.
//!
//! A [`Store`] keeps its table in memory. Committed operations reach it
//! through [`Store::apply_async`]; [`Store::checkpoint_async`] writes the
//! table out as a *generation* (a key file plus a value file sharing one
//! `file_id`); [`Store::open_async`] loads the last generation back, and
//! [`Store::replay_async`] brings it up to date from the operation log.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tokio_util::sync::CancellationToken;
//! use tstore::{
//!     ApplyContext, ModificationType, OperationMetadata, OperationRecord, Store, StoreConfig,
//!     TransactionId,
//! };
//!
//! # async fn run() -> Result<(), tstore::StoreError> {
//! let store = Store::open_async("/tmp/my_store", StoreConfig::default()).await?;
//! let cancel = CancellationToken::new();
//!
//! // Apply a committed operation on the primary.
//! let add = OperationMetadata::new(ModificationType::Add, b"hello".to_vec());
//! let ctx = store
//!     .apply_async(1, TransactionId(1), ApplyContext::Primary, &add, Some(&b"world"[..]))
//!     .await?;
//! if let Some(ctx) = ctx {
//!     store.unlock(ctx)?;
//! }
//!
//! // Make it durable.
//! store.checkpoint_async(&cancel).await?;
//! store.close_async().await?;
//!
//! // After a restart: load the checkpoint, then replay the log tail.
//! let store = Store::open_async("/tmp/my_store", StoreConfig::default()).await?;
//! let log = vec![OperationRecord::update(2, TransactionId(2), b"hello".to_vec(), b"again".to_vec())];
//! let stats = store.replay_async(log, &cancel).await?;
//! assert_eq!(stats.applied, 1);
//! assert_eq!(store.get(b"hello")?, Some(b"again".to_vec()));
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **All-or-nothing checkpoint files**: a generation is readable only
//!   after its footer and final flush are on disk.
//! - **Atomic generation switch**: the `CHECKPOINT` pointer is replaced by
//!   rename; the previous generation is deleted only afterwards.
//! - **Idempotent replay**: redelivered operations are recognised by LSN.
//! - **CRC32 integrity**: blocks, key chunks, and values are checksummed.
//! - **Concurrent readers**: sealed files hand out pooled read streams.

pub mod block;
pub mod checkpoint;
pub mod encoding;
pub mod store;
pub mod stream;

use std::time::Duration;

pub use checkpoint::{CheckpointConfig, RecordKind};
pub use store::{
    ApplyContext, CheckpointMetadata, ModificationType, OperationContext, OperationMetadata,
    OperationRecord, ReplayStats, Store, StoreError, StoreStats, TransactionId, VersionedItem,
};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Store`].
///
/// All fields have defaults via [`StoreConfig::default()`]. The
/// configuration is validated when passed to [`Store::open_async`].
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tstore::StoreConfig;
///
/// let config = StoreConfig {
///     write_buffer_size: 256 * 1024,
///     lock_timeout: Duration::from_secs(1),
///     ..StoreConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Bytes staged in memory before a checkpoint file writes them out.
    ///
    /// Default: 64 KiB. Must be >= 64.
    pub write_buffer_size: usize,

    /// Idle read streams each checkpoint file keeps open.
    ///
    /// Default: 4. Must be >= 1.
    pub max_idle_streams: usize,

    /// How long an operation waits for a key locked by another transaction.
    ///
    /// Default: 5 s. Must be non-zero.
    pub lock_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 64 * 1024,
            max_idle_streams: 4,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

impl StoreConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.write_buffer_size < 64 {
            return Err(StoreError::InvalidConfig(
                "write_buffer_size must be >= 64".into(),
            ));
        }
        if self.max_idle_streams < 1 {
            return Err(StoreError::InvalidConfig(
                "max_idle_streams must be >= 1".into(),
            ));
        }
        if self.lock_timeout.is_zero() {
            return Err(StoreError::InvalidConfig(
                "lock_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// The part of the configuration checkpoint files use.
    pub fn to_checkpoint_config(&self) -> CheckpointConfig {
        CheckpointConfig {
            write_buffer_size: self.write_buffer_size,
            max_idle_streams: self.max_idle_streams,
        }
    }
}
