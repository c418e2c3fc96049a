use super::StorageSink;
use crate::error::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Stores attachments below a local root directory.
pub struct DiskSink {
    root: PathBuf,
}

impl DiskSink {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, logical_path: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in logical_path.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                continue;
            }
            path.push(part);
        }
        path
    }
}

#[async_trait]
impl StorageSink for DiskSink {
    async fn put(&self, bytes: Bytes, logical_path: &str) -> Result<String, StorageError> {
        let target = self.resolve(logical_path);
        let stored = target.clone();

        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let dir = target.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)?;
            // Written beside the target and renamed over it, so an existing
            // file is replaced whole or not at all.
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| StorageError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Request(format!("disk write task failed: {}", e)))??;

        debug!("DiskSink: stored {}", stored.display());
        Ok(stored.to_string_lossy().into_owned())
    }

    async fn check(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }
}
