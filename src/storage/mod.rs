//! Attachment storage backends.

pub mod disk;
pub mod webdav;

use crate::config::{Config, StorageBackend};
use crate::error::StorageError;
use crate::model::Location;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub use disk::DiskSink;
pub use webdav::WebDavSink;

/// Writes attachment bytes under a hierarchical logical path and returns
/// where they ended up. Putting the same path twice must leave a complete
/// object behind, never a torn one.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn put(&self, bytes: Bytes, logical_path: &str) -> Result<String, StorageError>;

    /// Reachability check used at startup.
    async fn check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

pub fn build_sink(config: &Config) -> anyhow::Result<Arc<dyn StorageSink>> {
    match config.storage_backend {
        StorageBackend::Disk => Ok(Arc::new(DiskSink::new(&config.storage_dir))),
        StorageBackend::WebDav => Ok(Arc::new(WebDavSink::from_config(config)?)),
    }
}

/// `{guild}/{author}/{location}/{YYYYmmdd_HHMMSS}_{message}_{n}_{filename}`,
/// where the location segment is the thread id for threads and the channel
/// id otherwise. The message id and attachment index keep same-named files
/// from different messages (or one message) apart.
pub fn logical_path(
    location: &Location,
    author_id: u64,
    sent_at: DateTime<Utc>,
    message_id: u64,
    index: usize,
    filename: &str,
) -> String {
    format!(
        "{}/{}/{}/{}_{}_{}_{}",
        location.guild_id,
        author_id,
        location.target_channel(),
        sent_at.format("%Y%m%d_%H%M%S"),
        message_id,
        index,
        make_safe_filename(filename)
    )
}

/// Keeps the final path component and replaces anything outside
/// `[A-Za-z0-9._-]` with `_`.
pub fn make_safe_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let safe: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = safe.trim_start_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}
