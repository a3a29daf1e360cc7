//! Benchmarks for checkpoint write and recovery.
//!
//! Uses Criterion with the Tokio executor; every iteration runs the real
//! async file path against a temporary directory.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench checkpoint              # run everything
//! cargo bench --bench checkpoint -- recovery  # filter by group
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use std::path::Path;

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use tstore::{
    ApplyContext, ModificationType, OperationMetadata, OperationRecord, Store, StoreConfig,
    TransactionId,
};

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

const KEY_COUNTS: [u64; 3] = [100, 1_000, 10_000];

fn make_key(i: u64) -> Vec<u8> {
    format!("key-{i:012}").into_bytes()
}

/// Values between 16 and 512 bytes, fixed per seed.
fn make_values(count: u64) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    (0..count)
        .map(|_| {
            let len = rng.random_range(16..=512);
            (0..len).map(|_| rng.random::<u8>()).collect()
        })
        .collect()
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

/// Open a store in `dir` and commit `count` keys as primary operations.
async fn populate(dir: &Path, count: u64) -> Store {
    let store = Store::open_async(dir, StoreConfig::default())
        .await
        .expect("open");
    for (i, value) in make_values(count).into_iter().enumerate() {
        let lsn = i as i64 + 1;
        let metadata = OperationMetadata::new(ModificationType::Add, make_key(i as u64));
        let ctx = store
            .apply_async(
                lsn,
                TransactionId(lsn as u64),
                ApplyContext::Primary,
                &metadata,
                Some(value.as_slice()),
            )
            .await
            .expect("apply");
        if let Some(ctx) = ctx {
            store.unlock(ctx).expect("unlock");
        }
    }
    store
}

// ------------------------------------------------------------------------------------------------
// Checkpoint
// ------------------------------------------------------------------------------------------------

/// Full checkpoint of an in-memory table: snapshot, write both files,
/// seal, publish the pointer and delete the previous generation.
fn bench_checkpoint(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("checkpoint");
    group.sample_size(20);

    for count in KEY_COUNTS {
        let dir = TempDir::new().expect("tempdir");
        let store = rt.block_on(populate(dir.path(), count));
        let cancel = CancellationToken::new();

        group.throughput(Throughput::Elements(count));
        group.bench_function(BenchmarkId::new("write", count), |b| {
            let (store, cancel) = (&store, &cancel);
            b.to_async(&rt).iter(|| async move {
                store.checkpoint_async(cancel).await.expect("checkpoint");
            });
        });

        rt.block_on(store.close_async()).expect("close");
    }
    group.finish();
}

// ------------------------------------------------------------------------------------------------
// Recovery
// ------------------------------------------------------------------------------------------------

/// Open a checkpointed directory: read the pointer, both footers, every key
/// chunk and every value.
fn bench_recovery(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("recovery");
    group.sample_size(20);

    for count in KEY_COUNTS {
        let dir = TempDir::new().expect("tempdir");
        rt.block_on(async {
            let store = populate(dir.path(), count).await;
            store
                .checkpoint_async(&CancellationToken::new())
                .await
                .expect("checkpoint");
            store.close_async().await.expect("close");
        });

        group.throughput(Throughput::Elements(count));
        group.bench_function(BenchmarkId::new("open", count), |b| {
            let path = dir.path();
            b.to_async(&rt).iter(|| async move {
                let store = Store::open_async(path, StoreConfig::default())
                    .await
                    .expect("open");
                store.close_async().await.expect("close");
            });
        });
    }
    group.finish();
}

/// Replaying a log that the checkpoint already covers: every record is a
/// redelivery and must be skipped by LSN.
fn bench_redelivery(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("redelivery");

    let count = 1_000u64;
    let dir = TempDir::new().expect("tempdir");
    let store = rt.block_on(async {
        let store = populate(dir.path(), count).await;
        store
            .checkpoint_async(&CancellationToken::new())
            .await
            .expect("checkpoint");
        store
    });
    let log: Vec<_> = make_values(count)
        .into_iter()
        .enumerate()
        .map(|(i, value)| {
            let lsn = i as i64 + 1;
            OperationRecord::add(lsn, TransactionId(lsn as u64), make_key(i as u64), value)
        })
        .collect();
    let cancel = CancellationToken::new();

    group.throughput(Throughput::Elements(count));
    group.bench_function("replay_skipped_1000", |b| {
        let (store, cancel) = (&store, &cancel);
        b.to_async(&rt).iter_batched(
            || log.clone(),
            |log| async move {
                store.replay_async(log, cancel).await.expect("replay");
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();

    rt.block_on(store.close_async()).expect("close");
}

criterion_group!(benches, bench_checkpoint, bench_recovery, bench_redelivery);
criterion_main!(benches);
