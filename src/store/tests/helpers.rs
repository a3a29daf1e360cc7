use std::{path::Path, time::Duration};

use tracing_subscriber::EnvFilter;

use crate::StoreConfig;
use crate::store::{
    ApplyContext, ModificationType, OperationContext, OperationMetadata, Store, StoreError,
    TransactionId,
};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small buffers and a short lock timeout so tests exercise chunking and
/// lock expiry quickly.
pub fn test_config() -> StoreConfig {
    StoreConfig {
        write_buffer_size: 64,
        max_idle_streams: 2,
        lock_timeout: Duration::from_millis(200),
    }
}

pub async fn open_store(dir: &Path) -> Store {
    Store::open_async(dir, test_config()).await.unwrap()
}

/// Apply one operation without unlocking.
pub async fn apply(
    store: &Store,
    commit_lsn: i64,
    txn: u64,
    context: ApplyContext,
    modification: ModificationType,
    key: &[u8],
    value: Option<&[u8]>,
) -> Result<Option<OperationContext>, StoreError> {
    let metadata = OperationMetadata::new(modification, key.to_vec());
    store
        .apply_async(commit_lsn, TransactionId(txn), context, &metadata, value)
        .await
}

/// Apply one primary operation as its own transaction and unlock it.
pub async fn commit(
    store: &Store,
    commit_lsn: i64,
    modification: ModificationType,
    key: &[u8],
    value: Option<&[u8]>,
) {
    let ctx = apply(
        store,
        commit_lsn,
        commit_lsn as u64,
        ApplyContext::Primary,
        modification,
        key,
        value,
    )
    .await
    .unwrap();
    if let Some(ctx) = ctx {
        store.unlock(ctx).unwrap();
    }
}
