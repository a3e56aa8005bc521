//! Staging downloader
//!
//! Pulls one table's export shards from the bucket into
//! `<work_dir>/staging/<table>/`. Shards are streamed in fixed-size chunks so
//! a multi-gigabyte export never sits in memory.

use rs2bq_common::checksum::{md5_from_etag, verify_file_md5};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use crate::config::StagingConfig;
use crate::error::{MigrateError, Result};
use crate::storage::{ObjectEntry, ObjectStore};

/// Read buffer size for object bodies
pub const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// One downloaded export shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedObject {
    pub key: String,
    pub local_path: PathBuf,
    pub size: u64,
}

pub struct StagingDownloader {
    store: Arc<dyn ObjectStore>,
    bucket: StagingConfig,
    staging_root: PathBuf,
}

impl StagingDownloader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: StagingConfig,
        staging_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            bucket,
            staging_root: staging_root.into(),
        }
    }

    /// Local directory holding a table's shards
    pub fn table_dir(&self, table: &str) -> PathBuf {
        self.staging_root.join(table)
    }

    /// Download every export object of `table`, in listing order.
    ///
    /// An empty listing returns an empty vec and touches nothing on disk.
    #[instrument(skip(self))]
    pub async fn download(&self, table: &str) -> Result<Vec<StagedObject>> {
        let prefix = self.bucket.table_prefix(table);
        let entries: Vec<ObjectEntry> = self
            .store
            .list_objects(&prefix)
            .await?
            .into_iter()
            .filter(|entry| !entry.is_directory_marker())
            .collect();

        if entries.is_empty() {
            info!(table, "No export objects found under {}", prefix);
            return Ok(Vec::new());
        }

        let table_dir = self.table_dir(table);
        tokio::fs::create_dir_all(&table_dir).await?;

        let mut staged = Vec::with_capacity(entries.len());
        for entry in &entries {
            let local_path = table_dir.join(entry.file_name());
            let size = self.fetch(entry, &local_path).await?;
            staged.push(StagedObject {
                key: entry.key.clone(),
                local_path,
                size,
            });
        }

        info!(
            table,
            files = staged.len(),
            bytes = staged.iter().map(|s| s.size).sum::<u64>(),
            "Export downloaded"
        );
        Ok(staged)
    }

    /// Remove a table's staging directory; a missing directory is not an error
    #[instrument(skip(self))]
    pub async fn cleanup(&self, table: &str) -> Result<()> {
        let table_dir = self.table_dir(table);
        match tokio::fs::remove_dir_all(&table_dir).await {
            Ok(()) => {
                debug!("Removed {}", table_dir.display());
                Ok(())
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, entry), fields(key = %entry.key))]
    async fn fetch(&self, entry: &ObjectEntry, local_path: &Path) -> Result<u64> {
        let mut body = self.store.get_object(&entry.key).await?;
        let mut file = tokio::fs::File::create(local_path).await?;
        let mut buffer = vec![0u8; DOWNLOAD_CHUNK_SIZE];
        let mut written = 0u64;

        loop {
            let n = body.read(&mut buffer).await.map_err(|e| {
                MigrateError::object_store(format!("Reading {} failed: {}", entry.key, e))
            })?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n]).await?;
            written += n as u64;
        }
        file.flush().await?;
        drop(file);

        if entry.size >= 0 && written != entry.size as u64 {
            warn!(
                expected = entry.size,
                actual = written,
                "Downloaded size differs from listing"
            );
        }

        if let Some(expected) = entry.e_tag.as_deref().and_then(md5_from_etag) {
            let path = local_path.to_path_buf();
            tokio::task::spawn_blocking(move || verify_file_md5(&path, &expected))
                .await
                .map_err(|e| MigrateError::object_store(format!("Checksum task failed: {}", e)))?
                .map_err(|e| MigrateError::object_store(e.to_string()))?;
        }

        debug!(bytes = written, "Saved {}", local_path.display());
        Ok(written)
    }
}
