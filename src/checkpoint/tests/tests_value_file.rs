//! Value checkpoint file tests: reads by handle and checksum, damaged or
//! out-of-region handles, the seal requirement, and pooled concurrent reads.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use super::super::helpers::*;
    use crate::block::{self, BlockHandle};
    use crate::checkpoint::{CheckpointConfig, CheckpointError, ValueCheckpointFile};
    use crate::stream::FileDisposition;

    /// # Scenario
    /// Values of varying length, including an empty one, are written through
    /// a small buffer, sealed, and read back after reopening.
    ///
    /// # Expected behavior
    /// Handles are contiguous from offset zero and every value verifies
    /// against the checksum returned at write time.
    #[tokio::test]
    async fn values_round_trip_by_handle() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.val");
        let config = small_config();
        let cancel = CancellationToken::new();

        let mut values: Vec<Vec<u8>> = (0..30).map(value_for).collect();
        values.push(Vec::new());

        let mut file =
            ValueCheckpointFile::create_async(&path, 1, FileDisposition::OpenAlways, &config)
                .await
                .unwrap();
        let mut located = Vec::new();
        let mut expected_offset = 0;
        for value in &values {
            let (handle, crc) = file.write_value_async(value, &cancel).await.unwrap();
            assert_eq!(handle, BlockHandle::new(expected_offset, value.len() as u64));
            assert_eq!(crc, block::crc32(value));
            expected_offset += value.len() as u64;
            located.push((handle, crc));
        }
        file.flush_async(&cancel).await.unwrap();
        file.close_async().await.unwrap();

        let file = ValueCheckpointFile::open_async(&path, &config, &cancel)
            .await
            .unwrap();
        assert_eq!(file.value_count(), values.len() as u64);
        assert_eq!(file.properties().values_handle, BlockHandle::new(0, expected_offset));

        for (value, (handle, crc)) in values.iter().zip(&located).rev() {
            let read = file.read_value_async(*handle, *crc, &cancel).await.unwrap();
            assert_eq!(&read, value);
        }
    }

    /// # Scenario
    /// A value is read with a checksum that does not match its bytes.
    ///
    /// # Expected behavior
    /// `CorruptFile`.
    #[tokio::test]
    async fn checksum_mismatch_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000002.val");
        let config = CheckpointConfig::default();
        let cancel = CancellationToken::new();

        let mut file =
            ValueCheckpointFile::create_async(&path, 2, FileDisposition::OpenAlways, &config)
                .await
                .unwrap();
        let (handle, crc) = file.write_value_async(b"payload", &cancel).await.unwrap();
        file.flush_async(&cancel).await.unwrap();

        let err = file
            .read_value_async(handle, crc ^ 1, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::CorruptFile(_)), "{err:?}");
    }

    /// # Scenario
    /// A handle that reaches past the values region into the properties.
    ///
    /// # Expected behavior
    /// `CorruptFile` before any I/O.
    #[tokio::test]
    async fn handle_outside_region_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000003.val");
        let config = CheckpointConfig::default();
        let cancel = CancellationToken::new();

        let mut file =
            ValueCheckpointFile::create_async(&path, 3, FileDisposition::OpenAlways, &config)
                .await
                .unwrap();
        file.write_value_async(b"abc", &cancel).await.unwrap();
        file.flush_async(&cancel).await.unwrap();

        let err = file
            .read_value_async(BlockHandle::new(1, 10), 0, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::CorruptFile(_)), "{err:?}");
    }

    /// # Scenario
    /// Value read from a file that has not been sealed.
    ///
    /// # Expected behavior
    /// `InvalidState`.
    #[tokio::test]
    async fn read_before_seal_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000004.val");
        let cancel = CancellationToken::new();
        let mut file = ValueCheckpointFile::create_async(
            &path,
            4,
            FileDisposition::OpenAlways,
            &CheckpointConfig::default(),
        )
        .await
        .unwrap();
        let (handle, crc) = file.write_value_async(b"abc", &cancel).await.unwrap();

        let err = file.read_value_async(handle, crc, &cancel).await.unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidState(_)));
    }

    /// # Scenario
    /// Many tasks read different values of one sealed file at once.
    ///
    /// # Expected behavior
    /// Every read returns its own value.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reads_use_pooled_streams() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000005.val");
        let config = small_config();
        let cancel = CancellationToken::new();

        let mut file =
            ValueCheckpointFile::create_async(&path, 5, FileDisposition::OpenAlways, &config)
                .await
                .unwrap();
        let mut located = Vec::new();
        for i in 0..16 {
            located.push(file.write_value_async(&value_for(i), &cancel).await.unwrap());
        }
        file.flush_async(&cancel).await.unwrap();
        let file = Arc::new(file);

        let mut tasks = Vec::new();
        for (i, (handle, crc)) in located.into_iter().enumerate() {
            let file = Arc::clone(&file);
            tasks.push(tokio::spawn(async move {
                let value = file
                    .read_value_async(handle, crc, &CancellationToken::new())
                    .await
                    .unwrap();
                (i, value)
            }));
        }
        for task in tasks {
            let (i, value) = task.await.unwrap();
            assert_eq!(value, value_for(i));
        }
    }
}
