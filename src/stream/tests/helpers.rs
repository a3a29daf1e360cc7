use std::{io, path::Path, time::Duration};

use async_trait::async_trait;
use tracing_subscriber::EnvFilter;

use crate::stream::{FileDisposition, FileStream, StreamFactory};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Write `bytes` into a fresh file at `path` and seal it.
pub async fn write_file(path: &Path, bytes: &[u8]) {
    let mut stream = FileStream::open(path, FileDisposition::OpenAlways)
        .await
        .unwrap();
    stream.write_async(bytes).await.unwrap();
    stream.flush_async().await.unwrap();
    stream.close_async().await.unwrap();
}

/// Factory that stalls before opening, to hold an acquire in flight.
pub struct SlowFactory {
    pub path: std::path::PathBuf,
    pub delay: Duration,
}

#[async_trait]
impl StreamFactory for SlowFactory {
    async fn create_stream(&self) -> io::Result<FileStream> {
        tokio::time::sleep(self.delay).await;
        FileStream::open(&self.path, FileDisposition::OpenExisting).await
    }
}
