//! # Store
//!
//! The in-memory, versioned key-value table together with the machinery
//! that makes it durable: the apply state machine, checkpoints, and
//! recovery.
//!
//! ## Design Overview
//!
//! Every key maps to a [`VersionedItem`] holding the LSN of the last
//! operation that touched it. Removed keys stay in the table as tombstones
//! so their LSN survives, which is what lets a redelivered `Add` for a key
//! that was later removed be recognised as stale. Once a checkpoint covers a
//! tombstone's LSN the covered LSN guards it instead, and the tombstone is
//! dropped from the table and from every later generation.
//!
//! Per key, operations move the item through
//!
//! ```text
//! Absent --Add--> Present(lsn) --Update--> Present(lsn') --Remove--> Deleted(lsn'')
//!                                                                      |
//!                         Present(lsn''') <-----------Add--------------+
//! ```
//!
//! and every transition is decided by comparing the incoming `commit_lsn`
//! with the stored one, never by arrival order.
//!
//! ### Apply contexts
//!
//! - [`ApplyContext::Primary`] is strict: `Add` on a live key, `Update` or
//!   `Remove` on an absent key, and a `commit_lsn` not above the key's
//!   current LSN or the covered LSN are errors.
//! - [`ApplyContext::SecondaryRedo`] and [`ApplyContext::RecoveryRedo`] are
//!   idempotent: a record at or below the key's LSN, or at or below the
//!   checkpoint LSN, is a no-op that still succeeds.
//!
//! ### Checkpoints
//!
//! [`Store::checkpoint_async`] runs in three steps:
//!
//! 1. **Prepare**: under the table lock, pick the checkpoint LSN, raise the
//!    covered LSN to it, snapshot the table and allocate a `file_id` above
//!    every id this store or the on-disk pointer has used. The checkpoint
//!    LSN is the last applied LSN, held below the lowest LSN of any
//!    transaction that is still open.
//! 2. **Perform**: write the snapshot into a fresh key/value file pair and
//!    seal it.
//! 3. **Complete**: publish the [`CheckpointMetadata`] pointer, switch the
//!    in-memory generation, drop covered tombstones, and delete the previous
//!    pair.
//!
//! A failure before the pointer is published deletes the partial pair; the
//! previous generation stays authoritative. If publishing reports an error
//! but the pointer on disk already names the new pair, the store adopts it
//! and keeps the previous pair until the next open removes it.
//!
//! ### Recovery
//!
//! [`Store::open_async`] loads the generation the pointer names, deletes
//! pair files it does not name, and leaves the caller to feed post-checkpoint
//! log records through [`Store::replay_async`].
//!
//! ## Concurrency model
//!
//! - The table sits behind a `std::sync::RwLock` that is never held across
//!   an `.await`.
//! - Checkpoints (and `close_async`) serialize on an async mutex.
//! - Transactions lock keys through the lock manager; waits are bounded by
//!   `lock_timeout`.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub(crate) mod locks;
pub mod metadata;
pub mod operation;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Re-exports
// ------------------------------------------------------------------------------------------------

pub use metadata::{CheckpointMetadata, METADATA_FILE_NAME};
pub use operation::{
    ApplyContext, ModificationType, OperationContext, OperationMetadata, OperationRecord,
    TransactionId,
};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::{
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::StoreConfig;
use crate::checkpoint::{
    self, CheckpointConfig, CheckpointError, CheckpointFile, MAX_KEY_LEN, RecordKind,
};
use crate::encoding::EncodingError;
use locks::LockManager;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Store`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Any other checkpoint file failure.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[source] CheckpointError),

    /// A checkpoint file or the checkpoint pointer is unreadable.
    #[error("corrupt file: {0}")]
    CorruptFile(String),

    /// The operation is malformed (bad LSN, value where none belongs...).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// `Add` on a live key in the primary context.
    #[error("key already exists: {0:?}")]
    KeyExists(Vec<u8>),

    /// `Update` or `Remove` on an absent key in the primary context.
    #[error("key not found: {0:?}")]
    KeyNotFound(Vec<u8>),

    /// Primary operation whose LSN does not advance the key.
    #[error("stale LSN {commit_lsn} for key {key:?} (current {current_lsn})")]
    StaleLsn {
        key: Vec<u8>,
        commit_lsn: i64,
        current_lsn: i64,
    },

    /// Another transaction held the key for longer than `lock_timeout`.
    #[error("{txn} timed out waiting for key {key:?}")]
    LockTimeout { txn: TransactionId, key: Vec<u8> },

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<CheckpointError> for StoreError {
    fn from(e: CheckpointError) -> Self {
        match e {
            CheckpointError::Io(e) => Self::Io(e),
            CheckpointError::Encoding(e) => Self::Encoding(e),
            CheckpointError::CorruptFile(msg) => Self::CorruptFile(msg),
            CheckpointError::Cancelled => Self::Cancelled,
            CheckpointError::Closed => Self::Closed,
            other => Self::Checkpoint(other),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Table entries
// ------------------------------------------------------------------------------------------------

/// The stored version of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedItem {
    pub kind: RecordKind,
    pub lsn: i64,
    /// `None` exactly for tombstones.
    pub value: Option<Vec<u8>>,
}

impl VersionedItem {
    pub fn is_live(&self) -> bool {
        !self.kind.is_deleted()
    }
}

/// Counters describing a replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records that changed the table.
    pub applied: u64,

    /// Records already reflected in the table or the checkpoint.
    pub skipped: u64,
}

/// Point-in-time view of store state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub live_keys: usize,
    pub tombstones: usize,
    pub checkpoint_lsn: i64,
    pub last_applied_lsn: i64,
    pub current_file_id: u32,
    pub locked_keys: usize,
}

#[derive(Debug, Default)]
struct StoreState {
    table: BTreeMap<Vec<u8>, VersionedItem>,

    /// LSN covered by the current generation. `0` before the first checkpoint.
    checkpoint_lsn: i64,

    /// LSN covered by the newest checkpoint started, published or not.
    /// Nothing at or below it is applied any more.
    covered_lsn: i64,

    /// Highest LSN applied to the table.
    last_applied_lsn: i64,

    /// Generation the pointer names. `0` before the first checkpoint.
    current_file_id: u32,

    /// Highest generation id allocated, published or not.
    last_file_id: u32,
}

impl StoreState {
    /// Whether a redo record is already reflected.
    fn is_reflected(&self, key: &[u8], commit_lsn: i64) -> bool {
        commit_lsn <= self.covered_lsn
            || self.table.get(key).is_some_and(|item| item.lsn >= commit_lsn)
    }

    /// Highest LSN a snapshot taken now fully reflects.
    ///
    /// An open transaction may still apply at its own LSN, so the snapshot
    /// stops just below it.
    fn snapshot_lsn(&self, oldest_active: Option<i64>) -> i64 {
        let settled = match oldest_active {
            Some(lsn) => self.last_applied_lsn.min(lsn - 1),
            None => self.last_applied_lsn,
        };
        settled.max(self.covered_lsn)
    }

    /// Table entries a generation at `checkpoint_lsn` must carry.
    fn snapshot(&self, checkpoint_lsn: i64) -> BTreeMap<Vec<u8>, VersionedItem> {
        self.table
            .iter()
            .filter(|(_, item)| is_retained(item, checkpoint_lsn))
            .map(|(key, item)| (key.clone(), item.clone()))
            .collect()
    }

    /// Apply one operation. Returns `false` for a redo no-op.
    fn apply_one(
        &mut self,
        commit_lsn: i64,
        context: ApplyContext,
        metadata: &OperationMetadata,
        value: Option<&[u8]>,
    ) -> Result<bool, StoreError> {
        let key = &metadata.key;

        if context.is_redo() {
            if self.is_reflected(key, commit_lsn) {
                return Ok(false);
            }
        } else {
            let current = self.table.get(key);
            if let Some(item) = current {
                if item.lsn >= commit_lsn {
                    return Err(StoreError::StaleLsn {
                        key: key.clone(),
                        commit_lsn,
                        current_lsn: item.lsn,
                    });
                }
            }
            if commit_lsn <= self.covered_lsn {
                return Err(StoreError::StaleLsn {
                    key: key.clone(),
                    commit_lsn,
                    current_lsn: self.covered_lsn,
                });
            }
            let live = current.is_some_and(VersionedItem::is_live);
            match (metadata.modification, live) {
                (ModificationType::Add, true) => return Err(StoreError::KeyExists(key.clone())),
                (ModificationType::Update | ModificationType::Remove, false) => {
                    return Err(StoreError::KeyNotFound(key.clone()));
                }
                _ => {}
            }
        }

        let item = match metadata.modification {
            ModificationType::Add => VersionedItem {
                kind: RecordKind::Inserted,
                lsn: commit_lsn,
                value: value.map(<[u8]>::to_vec),
            },
            ModificationType::Update => VersionedItem {
                kind: RecordKind::Updated,
                lsn: commit_lsn,
                value: value.map(<[u8]>::to_vec),
            },
            ModificationType::Remove => VersionedItem {
                kind: RecordKind::Deleted,
                lsn: commit_lsn,
                value: None,
            },
        };
        self.table.insert(key.clone(), item);
        self.last_applied_lsn = self.last_applied_lsn.max(commit_lsn);
        Ok(true)
    }
}

// ------------------------------------------------------------------------------------------------
// Store handle
// ------------------------------------------------------------------------------------------------

struct StoreShared {
    dir: PathBuf,
    checkpoint_config: CheckpointConfig,
    state: RwLock<StoreState>,
    locks: LockManager,
    checkpoint_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

/// Handle to an open store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreShared>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("dir", &self.inner.dir)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Store {
    fn read_state(&self) -> Result<RwLockReadGuard<'_, StoreState>, StoreError> {
        self.inner
            .state
            .read()
            .map_err(|_| StoreError::Internal("RwLock poisoned".into()))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, StoreState>, StoreError> {
        self.inner
            .state
            .write()
            .map_err(|_| StoreError::Internal("RwLock poisoned".into()))
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Open / recovery
    // --------------------------------------------------------------------------------------------

    /// Open (or create) the store in `dir` and load its last checkpoint.
    ///
    /// Pair files the checkpoint pointer does not name are leftovers of an
    /// interrupted checkpoint and are deleted.
    ///
    /// # Panics
    ///
    /// If the pointer names a generation whose files are missing or shorter
    /// than a footer.
    pub async fn open_async(dir: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        let checkpoint_config = config.to_checkpoint_config();
        tokio::fs::create_dir_all(&dir).await?;
        remove_if_present(&CheckpointMetadata::tmp_path(&dir)).await?;

        let mut state = StoreState::default();
        if let Some(metadata) = CheckpointMetadata::load_async(&dir).await? {
            let cancel = CancellationToken::new();
            state.table =
                load_generation(&dir, metadata.file_id, &checkpoint_config, &cancel).await?;
            state.checkpoint_lsn = metadata.checkpoint_lsn;
            state.covered_lsn = metadata.checkpoint_lsn;
            state.last_applied_lsn = metadata.checkpoint_lsn;
            state.current_file_id = metadata.file_id;
            state.last_file_id = metadata.file_id;
        }
        remove_orphans(&dir, state.current_file_id).await?;

        info!(
            path = %dir.display(),
            file_id = state.current_file_id,
            checkpoint_lsn = state.checkpoint_lsn,
            keys = state.table.len(),
            "store opened"
        );

        Ok(Self {
            inner: Arc::new(StoreShared {
                dir,
                checkpoint_config,
                state: RwLock::new(state),
                locks: LockManager::new(config.lock_timeout),
                checkpoint_lock: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Replay log records in order, unlocking each transaction as it goes.
    ///
    /// Redelivered records are counted as skipped. Stops at the first error.
    pub async fn replay_async<I>(
        &self,
        records: I,
        cancel: &CancellationToken,
    ) -> Result<ReplayStats, StoreError>
    where
        I: IntoIterator<Item = OperationRecord>,
    {
        let mut stats = ReplayStats::default();
        let mut previous_lsn = i64::MIN;

        for record in records {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            if record.commit_lsn < previous_lsn {
                trace!(
                    commit_lsn = record.commit_lsn,
                    previous_lsn, "replay record out of LSN order"
                );
            }
            previous_lsn = previous_lsn.max(record.commit_lsn);

            let (ctx, applied) = self
                .apply_inner(
                    record.commit_lsn,
                    record.transaction_id,
                    record.context,
                    &record.metadata(),
                    record.value.as_deref(),
                )
                .await?;
            if let Some(ctx) = ctx {
                self.unlock(ctx)?;
            }
            if applied {
                stats.applied += 1;
            } else {
                stats.skipped += 1;
            }
        }

        info!(applied = stats.applied, skipped = stats.skipped, "replay complete");
        Ok(stats)
    }

    // --------------------------------------------------------------------------------------------
    // Apply
    // --------------------------------------------------------------------------------------------

    /// Apply one operation to the table.
    ///
    /// Returns an [`OperationContext`] for the first operation of `txn`,
    /// which must later be passed to [`unlock`](Self::unlock). Redelivered
    /// operations in a redo context succeed without changing anything.
    pub async fn apply_async(
        &self,
        commit_lsn: i64,
        txn: TransactionId,
        context: ApplyContext,
        metadata: &OperationMetadata,
        redo_data: Option<&[u8]>,
    ) -> Result<Option<OperationContext>, StoreError> {
        let (ctx, _) = self
            .apply_inner(commit_lsn, txn, context, metadata, redo_data)
            .await?;
        Ok(ctx)
    }

    async fn apply_inner(
        &self,
        commit_lsn: i64,
        txn: TransactionId,
        context: ApplyContext,
        metadata: &OperationMetadata,
        value: Option<&[u8]>,
    ) -> Result<(Option<OperationContext>, bool), StoreError> {
        self.check_open()?;
        validate_operation(commit_lsn, metadata, value)?;
        let key = metadata.key.as_slice();

        let reflected = context.is_redo() && self.read_state()?.is_reflected(key, commit_lsn);
        if reflected {
            debug!(%txn, commit_lsn, ?context, "redelivered operation skipped");
            let first = self.inner.locks.begin(txn, commit_lsn)?;
            return Ok((first.then(|| OperationContext::new(txn)), false));
        }

        let first = self.inner.locks.begin(txn, commit_lsn)?;
        let outcome = match self.inner.locks.lock(txn, key).await {
            Ok(()) => self
                .write_state()
                .and_then(|mut state| state.apply_one(commit_lsn, context, metadata, value)),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(applied) => {
                trace!(
                    %txn,
                    commit_lsn,
                    ?context,
                    op = ?metadata.modification,
                    applied,
                    "operation applied"
                );
                Ok((first.then(|| OperationContext::new(txn)), applied))
            }
            Err(e) => {
                if first {
                    self.inner.locks.release(txn)?;
                }
                Err(e)
            }
        }
    }

    /// Release every lock `ctx`'s transaction holds and end it.
    ///
    /// A no-op for a transaction that has already been unlocked.
    pub fn unlock(&self, ctx: OperationContext) -> Result<(), StoreError> {
        let txn = ctx.transaction_id();
        match self.inner.locks.release(txn)? {
            Some(keys) => trace!(%txn, keys, "transaction unlocked"),
            None => debug!(%txn, "unlock of completed transaction ignored"),
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Checkpoint
    // --------------------------------------------------------------------------------------------

    /// Write the current table as a new generation and make it the recovery
    /// point. Returns the published pointer.
    pub async fn checkpoint_async(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CheckpointMetadata, StoreError> {
        self.check_open()?;
        let _serial = self.inner.checkpoint_lock.lock().await;
        self.check_open()?;

        // 1. Prepare
        let on_disk = CheckpointMetadata::load_async(&self.inner.dir)
            .await?
            .map_or(0, |pointer| pointer.file_id);
        let (snapshot, checkpoint_lsn, previous_id, file_id) = {
            let mut state = self.write_state()?;
            let oldest_active = self.inner.locks.oldest_active_lsn()?;
            let checkpoint_lsn = state.snapshot_lsn(oldest_active);
            let file_id = state
                .current_file_id
                .max(state.last_file_id)
                .max(on_disk)
                .checked_add(1)
                .ok_or_else(|| StoreError::Internal("checkpoint file ids exhausted".into()))?;
            state.covered_lsn = checkpoint_lsn;
            state.last_file_id = file_id;
            (
                state.snapshot(checkpoint_lsn),
                checkpoint_lsn,
                state.current_file_id,
                file_id,
            )
        };
        info!(file_id, checkpoint_lsn, keys = snapshot.len(), "checkpoint started");

        // 2. Perform
        if let Err(e) = self.write_generation(file_id, &snapshot, cancel).await {
            warn!(file_id, error = %e, "checkpoint write failed");
            self.discard_generation(file_id).await;
            return Err(e);
        }

        // 3. Complete
        let metadata = CheckpointMetadata::new(file_id, checkpoint_lsn);
        if let Err(e) = metadata.store_async(&self.inner.dir).await {
            warn!(file_id, error = %e, "checkpoint pointer publish failed");
            match CheckpointMetadata::load_async(&self.inner.dir).await {
                Ok(Some(current)) if current.file_id == file_id => {
                    // The rename landed. The previous pair stays until the
                    // next open, in case the rename is not durable.
                    self.adopt_generation(&metadata)?;
                }
                Ok(_) => self.discard_generation(file_id).await,
                Err(load_err) => {
                    warn!(file_id, error = %load_err, "pointer unreadable, keeping new pair");
                }
            }
            return Err(e);
        }
        self.adopt_generation(&metadata)?;

        if previous_id != 0 {
            if let Err(e) = CheckpointFile::delete_async(&self.inner.dir, previous_id).await {
                warn!(file_id = previous_id, error = %e, "failed to delete superseded checkpoint");
            }
        }

        info!(file_id, checkpoint_lsn, "checkpoint complete");
        Ok(metadata)
    }

    /// Make the published generation current and drop the tombstones it covers.
    fn adopt_generation(&self, metadata: &CheckpointMetadata) -> Result<(), StoreError> {
        let mut state = self.write_state()?;
        state.checkpoint_lsn = state.checkpoint_lsn.max(metadata.checkpoint_lsn);
        state.current_file_id = metadata.file_id;

        let before = state.table.len();
        let checkpoint_lsn = state.checkpoint_lsn;
        state.table.retain(|_, item| is_retained(item, checkpoint_lsn));
        let dropped = before - state.table.len();
        if dropped > 0 {
            debug!(file_id = metadata.file_id, dropped, "covered tombstones dropped");
        }
        Ok(())
    }

    async fn write_generation(
        &self,
        file_id: u32,
        snapshot: &BTreeMap<Vec<u8>, VersionedItem>,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let mut pair =
            CheckpointFile::create_async(&self.inner.dir, file_id, &self.inner.checkpoint_config)
                .await?;
        let written = fill_generation(&mut pair, snapshot, cancel).await;
        let closed = pair.close_async().await;
        written?;
        closed?;
        Ok(())
    }

    async fn discard_generation(&self, file_id: u32) {
        if let Err(e) = CheckpointFile::delete_async(&self.inner.dir, file_id).await {
            warn!(file_id, error = %e, "failed to delete partial checkpoint");
        }
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Current value of `key`; `None` if absent or removed.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_open()?;
        let state = self.read_state()?;
        Ok(state
            .table
            .get(key)
            .filter(|item| item.is_live())
            .and_then(|item| item.value.clone()))
    }

    /// Stored version of `key`, tombstones included.
    pub fn get_versioned(&self, key: &[u8]) -> Result<Option<VersionedItem>, StoreError> {
        self.check_open()?;
        Ok(self.read_state()?.table.get(key).cloned())
    }

    /// Number of live keys.
    pub fn len(&self) -> Result<usize, StoreError> {
        self.check_open()?;
        Ok(self
            .read_state()?
            .table
            .values()
            .filter(|item| item.is_live())
            .count())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    pub fn checkpoint_lsn(&self) -> Result<i64, StoreError> {
        self.check_open()?;
        Ok(self.read_state()?.checkpoint_lsn)
    }

    pub fn last_applied_lsn(&self) -> Result<i64, StoreError> {
        self.check_open()?;
        Ok(self.read_state()?.last_applied_lsn)
    }

    pub fn current_file_id(&self) -> Result<u32, StoreError> {
        self.check_open()?;
        Ok(self.read_state()?.current_file_id)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        self.check_open()?;
        let locked_keys = self.inner.locks.locked_keys()?;
        let state = self.read_state()?;
        let live_keys = state.table.values().filter(|item| item.is_live()).count();
        Ok(StoreStats {
            live_keys,
            tombstones: state.table.len() - live_keys,
            checkpoint_lsn: state.checkpoint_lsn,
            last_applied_lsn: state.last_applied_lsn,
            current_file_id: state.current_file_id,
            locked_keys,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Wait for an in-flight checkpoint, then refuse further operations.
    ///
    /// Calling `close_async` more than once is harmless.
    pub async fn close_async(&self) -> Result<(), StoreError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _serial = self.inner.checkpoint_lock.lock().await;
        info!(path = %self.inner.dir.display(), "store closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Tombstones at or below `checkpoint_lsn` are guarded by the covered LSN.
fn is_retained(item: &VersionedItem, checkpoint_lsn: i64) -> bool {
    item.is_live() || item.lsn > checkpoint_lsn
}

fn validate_operation(
    commit_lsn: i64,
    metadata: &OperationMetadata,
    value: Option<&[u8]>,
) -> Result<(), StoreError> {
    if commit_lsn <= 0 {
        return Err(StoreError::InvalidOperation(format!(
            "commit LSN must be positive, got {commit_lsn}"
        )));
    }
    if metadata.key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidOperation(format!(
            "key of {} bytes exceeds MAX_KEY_LEN ({MAX_KEY_LEN})",
            metadata.key.len()
        )));
    }
    match (metadata.modification, value) {
        (ModificationType::Add | ModificationType::Update, None) => Err(
            StoreError::InvalidOperation(format!("{:?} needs a value", metadata.modification)),
        ),
        (ModificationType::Remove, Some(_)) => Err(StoreError::InvalidOperation(
            "Remove carries no value".into(),
        )),
        _ => Ok(()),
    }
}

async fn fill_generation(
    pair: &mut CheckpointFile,
    snapshot: &BTreeMap<Vec<u8>, VersionedItem>,
    cancel: &CancellationToken,
) -> Result<(), StoreError> {
    for (key, item) in snapshot {
        pair.write_async(key, item.kind, item.lsn, item.value.as_deref(), cancel)
            .await?;
    }
    pair.flush_async(cancel).await?;
    Ok(())
}

/// Read every record of generation `file_id` back into a table.
async fn load_generation(
    dir: &Path,
    file_id: u32,
    config: &CheckpointConfig,
    cancel: &CancellationToken,
) -> Result<BTreeMap<Vec<u8>, VersionedItem>, StoreError> {
    let mut pair = CheckpointFile::open_async(dir, file_id, config, cancel).await?;
    let loaded = read_generation(&pair, cancel).await;
    let closed = pair.close_async().await;
    let table = loaded?;
    closed?;

    info!(file_id, keys = table.len(), "checkpoint loaded");
    Ok(table)
}

async fn read_generation(
    pair: &CheckpointFile,
    cancel: &CancellationToken,
) -> Result<BTreeMap<Vec<u8>, VersionedItem>, StoreError> {
    let mut table = BTreeMap::new();
    let mut records = pair.enumerate_async(cancel).await?;

    while let Some(record) = records.next_async(cancel).await? {
        let value = pair.read_value_async(&record, cancel).await?;
        let item = VersionedItem {
            kind: record.kind,
            lsn: record.lsn,
            value,
        };
        if table.insert(record.key, item).is_some() {
            return Err(StoreError::CorruptFile(format!(
                "generation {} lists a key twice",
                pair.file_id()
            )));
        }
    }
    Ok(table)
}

/// Delete checkpoint files of every generation except `keep`.
async fn remove_orphans(dir: &Path, keep: u32) -> Result<(), StoreError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(file_id) = name.to_str().and_then(checkpoint::parse_file_name) else {
            continue;
        };
        if file_id != keep {
            tokio::fs::remove_file(entry.path()).await?;
            info!(file_id, path = %entry.path().display(), "orphaned checkpoint file removed");
        }
    }
    Ok(())
}

async fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "stale file removed");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
