//! Persists one message and its attachments.
//!
//! The message row is the unit of dedup: it is inserted first, keyed by the
//! platform message id, and attachments are archived afterwards one by one.
//! An attachment that is rejected or fails to fetch/store is logged and
//! skipped; it never undoes the message row.

use crate::config::Config;
use crate::db::{BackupConfig, Database, NewFileBackup};
use crate::error::{FetchError, StorageError};
use crate::fetch::AttachmentFetcher;
use crate::model::{SourceAttachment, SourceMessage};
use crate::storage::{logical_path, StorageSink};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Archived(i64),
    AlreadyExists,
}

#[derive(Debug, Error, PartialEq)]
pub enum AttachmentRejection {
    #[error("extension '{0}' is not allowed")]
    DisallowedExtension(String),
    #[error("declared size {size} exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
}

#[derive(Debug, Error)]
enum AttachmentFailure {
    #[error("rejected: {0}")]
    Rejected(#[from] AttachmentRejection),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("database error: {0}")]
    Database(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct AttachmentPolicy {
    pub allowed_extensions: Vec<String>,
    pub max_file_size: u64,
}

impl AttachmentPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            allowed_extensions: config.allowed_extensions.clone(),
            max_file_size: config.max_file_size,
        }
    }

    pub fn check(&self, attachment: &SourceAttachment) -> Result<(), AttachmentRejection> {
        let extension = attachment
            .filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default();
        if !self.allowed_extensions.iter().any(|e| *e == extension) {
            return Err(AttachmentRejection::DisallowedExtension(extension));
        }
        if attachment.size > self.max_file_size {
            return Err(AttachmentRejection::TooLarge {
                size: attachment.size,
                limit: self.max_file_size,
            });
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Archiver {
    db: Database,
    fetcher: Arc<dyn AttachmentFetcher>,
    sink: Arc<dyn StorageSink>,
    policy: AttachmentPolicy,
}

impl Archiver {
    pub fn new(
        db: Database,
        fetcher: Arc<dyn AttachmentFetcher>,
        sink: Arc<dyn StorageSink>,
        policy: AttachmentPolicy,
    ) -> Self {
        Self {
            db,
            fetcher,
            sink,
            policy,
        }
    }

    pub fn fetcher(&self) -> Arc<dyn AttachmentFetcher> {
        self.fetcher.clone()
    }

    pub fn policy(&self) -> &AttachmentPolicy {
        &self.policy
    }

    pub async fn persist(
        &self,
        config: &BackupConfig,
        message: &SourceMessage,
    ) -> anyhow::Result<PersistOutcome> {
        let config_id = config.id;
        let message_id = message.id;
        let content = message.content.clone();
        let created_at = message.created_at;
        let content_type = message.location.content_type();
        let inserted = self
            .db
            .run_blocking(move |db| {
                db.insert_message_backup(config_id, message_id, &content, created_at, content_type)
            })
            .await?;

        let Some(backup_id) = inserted else {
            debug!("Archiver: message {} already archived", message.id);
            return Ok(PersistOutcome::AlreadyExists);
        };

        let mut stored = 0usize;
        for (index, attachment) in message.attachments.iter().enumerate() {
            match self
                .archive_attachment(config, message, backup_id, index, attachment)
                .await
            {
                Ok(()) => stored += 1,
                Err(AttachmentFailure::Rejected(reason)) => {
                    info!(
                        "Archiver: skipping attachment '{}' of message {}: {}",
                        attachment.filename, message.id, reason
                    );
                }
                Err(e) => {
                    warn!(
                        "Archiver: attachment '{}' of message {} not archived: {}",
                        attachment.filename, message.id, e
                    );
                }
            }
        }

        self.db.run_blocking(|db| db.record_activity(Utc::now())).await?;
        debug!(
            "Archiver: archived message {} for config {} ({}/{} attachments)",
            message.id,
            config.id,
            stored,
            message.attachments.len()
        );
        Ok(PersistOutcome::Archived(backup_id))
    }

    /// Applies an edit. Returns `true` when an existing backup was updated;
    /// a message not archived yet is persisted as new.
    pub async fn persist_edit(
        &self,
        config: &BackupConfig,
        message: &SourceMessage,
    ) -> anyhow::Result<bool> {
        let message_id = message.id;
        let content = message.content.clone();
        let updated = self
            .db
            .run_blocking(move |db| db.update_message_content(message_id, &content))
            .await?;
        if updated {
            debug!("Archiver: updated edited message {}", message.id);
            return Ok(true);
        }
        self.persist(config, message).await?;
        Ok(false)
    }

    async fn archive_attachment(
        &self,
        config: &BackupConfig,
        message: &SourceMessage,
        backup_id: i64,
        index: usize,
        attachment: &SourceAttachment,
    ) -> Result<(), AttachmentFailure> {
        self.policy.check(attachment)?;

        let bytes = self
            .fetcher
            .fetch(&attachment.url, self.policy.max_file_size)
            .await?;
        let size = bytes.len() as u64;
        let path = logical_path(
            &message.location,
            config.author_id,
            message.created_at,
            message.id,
            index,
            &attachment.filename,
        );
        let stored_location = self.sink.put(bytes, &path).await?;

        let filename = attachment.filename.clone();
        let url = attachment.url.clone();
        self.db
            .run_blocking(move |db| {
                db.insert_file_backup(&NewFileBackup {
                    message_backup_id: backup_id,
                    original_filename: &filename,
                    stored_location: &stored_location,
                    file_size: size,
                    source_url: &url,
                })
            })
            .await?;
        Ok(())
    }
}
