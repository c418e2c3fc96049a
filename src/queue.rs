//! Enable/disable notifications and the worker that applies them.

use crate::db::Database;
use crate::error::NotificationError;
use crate::model::Location;
use crate::sync::HistorySynchronizer;
use crate::tasks::execute_scan_task;
use chrono::{DateTime, NaiveDateTime};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const QUEUE_CAPACITY: usize = 256;
const EVENT_TYPE: &str = "backup_permission_update";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Enable {
        location: Location,
        author_id: u64,
        title: Option<String>,
    },
    Disable {
        location: Location,
        author_id: u64,
    },
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    event_type: String,
    timestamp: String,
    guild_id: String,
    channel_id: String,
    thread_id: String,
    author: WebhookAuthor,
    work_info: WebhookWorkInfo,
}

#[derive(Debug, Deserialize)]
struct WebhookAuthor {
    discord_user_id: String,
}

#[derive(Debug, Deserialize)]
struct WebhookWorkInfo {
    title: Option<String>,
    backup_allowed: bool,
}

fn parse_id(field: &'static str, value: &str) -> Result<u64, NotificationError> {
    value.trim().parse().map_err(|_| NotificationError::Id {
        field,
        value: value.to_string(),
    })
}

/// RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS[.fff]` local stamp.
fn is_iso8601(raw: &str) -> bool {
    DateTime::parse_from_rfc3339(raw).is_ok()
        || NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
}

impl Notification {
    /// Validates a permission-update webhook body. A thread id equal to the
    /// channel id means the post lives directly in the channel.
    pub fn from_webhook_json(body: &str) -> Result<Self, NotificationError> {
        let payload: WebhookPayload = serde_json::from_str(body)?;
        if payload.event_type != EVENT_TYPE {
            return Err(NotificationError::EventType(payload.event_type));
        }
        if !is_iso8601(&payload.timestamp) {
            return Err(NotificationError::Timestamp(payload.timestamp));
        }

        let guild_id = parse_id("guild_id", &payload.guild_id)?;
        let channel_id = parse_id("channel_id", &payload.channel_id)?;
        let thread_id = parse_id("thread_id", &payload.thread_id)?;
        let author_id = parse_id("author.discord_user_id", &payload.author.discord_user_id)?;
        let location = if thread_id == channel_id {
            Location::channel(guild_id, channel_id)
        } else {
            Location::thread(guild_id, channel_id, thread_id)
        };

        if payload.work_info.backup_allowed {
            Ok(Self::Enable {
                location,
                author_id,
                title: payload.work_info.title.filter(|t| !t.trim().is_empty()),
            })
        } else {
            Ok(Self::Disable {
                location,
                author_id,
            })
        }
    }
}

/// Single-consumer queue of notifications. Producers hold cheap
/// `NotificationSender` clones.
pub struct NotificationQueue {
    tx: mpsc::Sender<Notification>,
    rx: Mutex<mpsc::Receiver<Notification>>,
}

pub type NotificationSender = mpsc::Sender<Notification>;

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn sender(&self) -> NotificationSender {
        self.tx.clone()
    }

    /// Next notification, or `None` once `timeout` passes without one.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Notification> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }
}

pub struct NotificationProcessor {
    queue: NotificationQueue,
    db: Database,
    sync: HistorySynchronizer,
    poll: Duration,
}

impl NotificationProcessor {
    pub fn new(
        queue: NotificationQueue,
        db: Database,
        sync: HistorySynchronizer,
        poll: Duration,
    ) -> Self {
        Self {
            queue,
            db,
            sync,
            poll,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Notifications: shutting down");
                    break;
                }
                next = self.queue.recv_timeout(self.poll) => {
                    let Some(notification) = next else { continue };
                    if let Err(e) = self.apply(notification).await {
                        error!("Notifications: failed to apply notification: {}", e);
                    }
                }
            }
        }
    }

    /// Applies one notification. For `Enable`, returns the handle of the
    /// scan launched for it.
    pub async fn apply(&self, notification: Notification) -> anyhow::Result<Option<JoinHandle<()>>> {
        match notification {
            Notification::Enable {
                location,
                author_id,
                title,
            } => {
                let (config_id, task_id) = self
                    .db
                    .run_blocking(move |db| {
                        let id = db.create_backup_config(&location, author_id, title.as_deref())?;
                        if let Some(title) = &title {
                            db.update_config_title(id, title)?;
                        }
                        let task_id = db.create_scan_task(id)?;
                        Ok((id, task_id))
                    })
                    .await?;
                info!(
                    "Notifications: backup enabled for {} / author {} (config {}), scanning",
                    location, author_id, config_id
                );

                let db = self.db.clone();
                let sync = self.sync.clone();
                let handle = tokio::spawn(async move {
                    if let Err(e) = execute_scan_task(&db, &sync, task_id).await {
                        error!("Notifications: scan task {} errored: {}", task_id, e);
                    }
                });
                Ok(Some(handle))
            }
            Notification::Disable {
                location,
                author_id,
            } => {
                let disabled = self
                    .db
                    .run_blocking(move |db| match db.get_backup_config(&location, author_id)? {
                        Some(config) => db.disable_backup_config(config.id),
                        None => Ok(false),
                    })
                    .await?;
                if disabled {
                    info!(
                        "Notifications: backup disabled for {} / author {}",
                        location, author_id
                    );
                } else {
                    warn!(
                        "Notifications: no backup config for {} / author {} to disable",
                        location, author_id
                    );
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::{Archiver, AttachmentPolicy};
    use crate::rate_limit::RateLimiter;
    use crate::testing::{memory_db, message, MemoryFetcher, MemorySink, MemorySource};
    use chrono::Utc;
    use std::sync::Arc;

    fn payload(thread_id: &str, allowed: bool) -> String {
        serde_json::json!({
            "event_type": "backup_permission_update",
            "timestamp": "2024-05-01T12:00:00Z",
            "guild_id": "1",
            "channel_id": "2",
            "thread_id": thread_id,
            "message_id": "99",
            "author": {"discord_user_id": "7", "username": "u", "display_name": "U"},
            "work_info": {
                "title": "My Work",
                "content_preview": "",
                "license_type": "cc",
                "backup_allowed": allowed
            },
            "urls": {"discord_thread": "", "direct_message": ""}
        })
        .to_string()
    }

    #[test]
    fn test_webhook_payload_validation() {
        assert_eq!(
            Notification::from_webhook_json(&payload("3", true)).unwrap(),
            Notification::Enable {
                location: Location::thread(1, 2, 3),
                author_id: 7,
                title: Some("My Work".into()),
            }
        );
        assert_eq!(
            Notification::from_webhook_json(&payload("2", false)).unwrap(),
            Notification::Disable {
                location: Location::channel(1, 2),
                author_id: 7,
            }
        );

        let wrong_event = payload("3", true).replace("backup_permission_update", "other");
        assert!(matches!(
            Notification::from_webhook_json(&wrong_event),
            Err(NotificationError::EventType(_))
        ));
        let naive_time = payload("3", true).replace("2024-05-01T12:00:00Z", "2024-05-01T12:00:00.123");
        assert!(Notification::from_webhook_json(&naive_time).is_ok());
        let bad_time = payload("3", true).replace("2024-05-01T12:00:00Z", "yesterday");
        assert!(matches!(
            Notification::from_webhook_json(&bad_time),
            Err(NotificationError::Timestamp(_))
        ));
        assert!(matches!(
            Notification::from_webhook_json(&payload("abc", true)),
            Err(NotificationError::Id { field: "thread_id", .. })
        ));
        assert!(matches!(
            Notification::from_webhook_json("{}"),
            Err(NotificationError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let queue = NotificationQueue::new();
        assert!(queue.recv_timeout(Duration::from_millis(5)).await.is_none());

        let sent = Notification::Disable {
            location: Location::channel(1, 2),
            author_id: 7,
        };
        queue.sender().send(sent.clone()).await.unwrap();
        assert_eq!(queue.recv_timeout(Duration::from_millis(5)).await, Some(sent));
    }

    #[tokio::test]
    async fn test_enable_then_disable() {
        let db = memory_db();
        let location = Location::channel(1, 2);
        let source = Arc::new(MemorySource::new());
        source.push(message(1, location, 7, Utc::now()));
        let archiver = Archiver::new(
            db.clone(),
            Arc::new(MemoryFetcher::new()),
            Arc::new(MemorySink::new()),
            AttachmentPolicy {
                allowed_extensions: vec![],
                max_file_size: 0,
            },
        );
        let sync = HistorySynchronizer::new(db.clone(), source, RateLimiter::new(), archiver);
        let processor = NotificationProcessor::new(
            NotificationQueue::new(),
            db.clone(),
            sync,
            Duration::from_millis(5),
        );

        let handle = processor
            .apply(Notification::Enable {
                location,
                author_id: 7,
                title: Some("Work".into()),
            })
            .await
            .unwrap()
            .unwrap();
        handle.await.unwrap();

        let config = db.get_backup_config(&location, 7).unwrap().unwrap();
        assert!(config.enabled);
        assert_eq!(config.title.as_deref(), Some("Work"));
        assert_eq!(db.messages_for_config(config.id).unwrap().len(), 1);
        assert!(db.pending_scan_tasks(10).unwrap().is_empty());

        processor
            .apply(Notification::Disable {
                location,
                author_id: 7,
            })
            .await
            .unwrap();
        let config = db.get_backup_config(&location, 7).unwrap().unwrap();
        assert!(!config.enabled);
        assert!(db.list_enabled_configs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_processor_stops_on_cancel() {
        let db = memory_db();
        let archiver = Archiver::new(
            db.clone(),
            Arc::new(MemoryFetcher::new()),
            Arc::new(MemorySink::new()),
            AttachmentPolicy {
                allowed_extensions: vec![],
                max_file_size: 0,
            },
        );
        let sync = HistorySynchronizer::new(
            db.clone(),
            Arc::new(MemorySource::new()),
            RateLimiter::new(),
            archiver,
        );
        let queue = NotificationQueue::new();
        let sender = queue.sender();
        let processor = NotificationProcessor::new(queue, db.clone(), sync, Duration::from_millis(5));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(processor.run(cancel.clone()));

        sender
            .send(Notification::Enable {
                location: Location::channel(1, 2),
                author_id: 7,
                title: None,
            })
            .await
            .unwrap();
        for _ in 0..200 {
            if db.get_backup_config(&Location::channel(1, 2), 7).unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
        assert!(db.get_backup_config(&Location::channel(1, 2), 7).unwrap().is_some());
    }
}
