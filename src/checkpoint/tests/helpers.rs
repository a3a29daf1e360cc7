use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::block::{self, BLOCK_CHECKSUM_SIZE, FOOTER_SIZE, MIN_FILE_SIZE};
use crate::checkpoint::{CheckpointConfig, CheckpointFile, KeyRecord, RecordKind};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with a tiny write buffer so a handful of records spans many chunks.
pub fn small_config() -> CheckpointConfig {
    CheckpointConfig {
        write_buffer_size: 64,
        max_idle_streams: 2,
    }
}

pub fn key_for(i: usize) -> Vec<u8> {
    format!("key_{i:04}").into_bytes()
}

pub fn value_for(i: usize) -> Vec<u8> {
    format!("value_{i:04}_{}", "x".repeat(i % 7)).into_bytes()
}

/// Write `n` keys into generation `file_id` and seal it. Every third key is
/// a tombstone.
pub async fn write_generation(dir: &Path, file_id: u32, n: usize, config: &CheckpointConfig) {
    let cancel = CancellationToken::new();
    let mut pair = CheckpointFile::create_async(dir, file_id, config)
        .await
        .unwrap();
    for i in 0..n {
        if i % 3 == 2 {
            pair.write_async(&key_for(i), RecordKind::Deleted, i as i64, None, &cancel)
                .await
                .unwrap();
        } else {
            pair.write_async(
                &key_for(i),
                RecordKind::Inserted,
                i as i64,
                Some(value_for(i).as_slice()),
                &cancel,
            )
            .await
            .unwrap();
        }
    }
    pair.flush_async(&cancel).await.unwrap();
    pair.close_async().await.unwrap();
}

/// Records of a sealed key file, collected in append order.
pub async fn all_records(pair: &CheckpointFile) -> Vec<KeyRecord> {
    let cancel = CancellationToken::new();
    pair.enumerate_async(&cancel)
        .await
        .unwrap()
        .collect_async(&cancel)
        .await
        .unwrap()
}

/// Rewrite the footer version of a sealed file, keeping its checksum valid.
pub async fn rewrite_footer_version(path: &Path, version: u32) {
    let mut bytes = tokio::fs::read(path).await.unwrap();
    let len = bytes.len() as u64;
    let footer_start = (len - MIN_FILE_SIZE) as usize;
    let version_at = footer_start + FOOTER_SIZE as usize - 4;
    bytes[version_at..version_at + 4].copy_from_slice(&version.to_le_bytes());

    let payload_end = footer_start + FOOTER_SIZE as usize;
    let checksum = block::block_checksum(&bytes[footer_start..payload_end]);
    bytes[payload_end..payload_end + BLOCK_CHECKSUM_SIZE as usize]
        .copy_from_slice(&checksum.to_le_bytes());
    tokio::fs::write(path, bytes).await.unwrap();
}

/// Flip every bit of the byte at `at`.
pub async fn corrupt_byte(path: &Path, at: u64) {
    let mut bytes = tokio::fs::read(path).await.unwrap();
    bytes[at as usize] ^= 0xFF;
    tokio::fs::write(path, bytes).await.unwrap();
}
