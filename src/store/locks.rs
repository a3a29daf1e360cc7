//! Exclusive per-key locks owned by transactions.
//!
//! A transaction becomes *active* with its first applied operation and stays
//! active until it is unlocked. Every key it modifies stays locked to it for
//! that whole time, and its lowest commit LSN bounds what a checkpoint may
//! claim to cover. Waiters park on a [`Notify`] and re-check the table
//! whenever any transaction releases; each wait is bounded by the configured
//! timeout.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};
use tracing::{debug, trace};

use super::{StoreError, TransactionId};

#[derive(Debug)]
struct ActiveTransaction {
    /// Lowest commit LSN the transaction has applied with.
    lsn: i64,
    keys: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
struct LockTable {
    /// Key -> transaction holding it.
    owners: HashMap<Vec<u8>, TransactionId>,

    held: HashMap<TransactionId, ActiveTransaction>,
}

#[derive(Debug)]
pub(crate) struct LockManager {
    table: Mutex<LockTable>,
    released: Notify,
    timeout: Duration,
}

impl LockManager {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Notify::new(),
            timeout,
        }
    }

    fn table(&self) -> Result<MutexGuard<'_, LockTable>, StoreError> {
        self.table
            .lock()
            .map_err(|_| StoreError::Internal("lock table mutex poisoned".into()))
    }

    /// Mark `txn` active at `commit_lsn`. Returns `true` if it was not
    /// active before.
    pub(crate) fn begin(&self, txn: TransactionId, commit_lsn: i64) -> Result<bool, StoreError> {
        let mut table = self.table()?;
        if let Some(active) = table.held.get_mut(&txn) {
            active.lsn = active.lsn.min(commit_lsn);
            return Ok(false);
        }
        table.held.insert(
            txn,
            ActiveTransaction {
                lsn: commit_lsn,
                keys: Vec::new(),
            },
        );
        Ok(true)
    }

    /// Take the lock on `key` for `txn`, waiting for its current owner to
    /// release. Re-entrant for the owning transaction.
    pub(crate) async fn lock(&self, txn: TransactionId, key: &[u8]) -> Result<(), StoreError> {
        let deadline = Instant::now() + self.timeout;

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Registered before the check, so a release in between is not missed.
            notified.as_mut().enable();

            {
                let mut table = self.table()?;
                match table.owners.get(key).copied() {
                    Some(owner) if owner == txn => return Ok(()),
                    Some(owner) => trace!(%txn, %owner, "key lock busy, waiting"),
                    None => {
                        let Some(active) = table.held.get_mut(&txn) else {
                            return Err(StoreError::Internal(format!(
                                "{txn} locks a key without being active"
                            )));
                        };
                        active.keys.push(key.to_vec());
                        table.owners.insert(key.to_vec(), txn);
                        return Ok(());
                    }
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(%txn, timeout = ?self.timeout, "key lock wait timed out");
                return Err(StoreError::LockTimeout {
                    txn,
                    key: key.to_vec(),
                });
            }
        }
    }

    /// Release every lock of `txn` and end it.
    ///
    /// Returns the number of keys released, or `None` if `txn` was not active.
    pub(crate) fn release(&self, txn: TransactionId) -> Result<Option<usize>, StoreError> {
        let released = {
            let mut table = self.table()?;
            let Some(active) = table.held.remove(&txn) else {
                return Ok(None);
            };
            for key in &active.keys {
                table.owners.remove(key);
            }
            active.keys.len()
        };

        self.released.notify_waiters();
        Ok(Some(released))
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self, txn: TransactionId) -> Result<bool, StoreError> {
        Ok(self.table()?.held.contains_key(&txn))
    }

    /// Lowest commit LSN among active transactions.
    pub(crate) fn oldest_active_lsn(&self) -> Result<Option<i64>, StoreError> {
        Ok(self.table()?.held.values().map(|active| active.lsn).min())
    }

    /// Keys locked across all transactions.
    pub(crate) fn locked_keys(&self) -> Result<usize, StoreError> {
        Ok(self.table()?.owners.len())
    }
}
