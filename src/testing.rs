//! In-memory collaborators shared by unit tests.

use crate::db::Database;
use crate::error::{FetchError, SourceError, StorageError};
use crate::fetch::AttachmentFetcher;
use crate::model::{Location, SourceAttachment, SourceMessage};
use crate::source::{ContentSource, HistoryCursor, HistoryPage};
use crate::storage::StorageSink;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

pub fn memory_db() -> Database {
    let db = Database::open(":memory:").unwrap();
    db.execute_init().unwrap();
    db
}

/// Makes inserts of `message_id` fail with `reason`.
pub fn reject_message_insert(db: &Database, message_id: u64, reason: &str) {
    db.execute_batch(&format!(
        "CREATE TRIGGER reject_{id} BEFORE INSERT ON message_backups
         WHEN NEW.message_id = '{id}'
         BEGIN SELECT RAISE(ABORT, '{reason}'); END;",
        id = message_id,
        reason = reason
    ))
    .unwrap();
}

pub fn message(id: u64, location: Location, author_id: u64, at: DateTime<Utc>) -> SourceMessage {
    SourceMessage {
        id,
        location,
        author_id,
        content: format!("message {}", id),
        created_at: at,
        attachments: Vec::new(),
    }
}

pub fn attachment(filename: &str, size: u64) -> SourceAttachment {
    SourceAttachment {
        filename: filename.to_string(),
        size,
        url: format!("https://cdn.test/{}", filename),
    }
}

/// History keyed by the channel that holds it. Locations listed as missing
/// answer `NotFound`; `fail_after_pages` makes every later page fail.
#[derive(Default)]
pub struct MemorySource {
    history: Mutex<HashMap<u64, Vec<SourceMessage>>>,
    missing: Mutex<HashSet<u64>>,
    fail_after_pages: Mutex<Option<usize>>,
    stalled: AtomicBool,
    pub pages_served: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: SourceMessage) {
        let mut history = self.history.lock().unwrap();
        let entry = history.entry(message.location.target_channel()).or_default();
        entry.push(message);
        entry.sort_by_key(|m| (m.created_at, m.id));
    }

    pub fn mark_missing(&self, location: &Location) {
        self.missing.lock().unwrap().insert(location.target_channel());
    }

    pub fn fail_after_pages(&self, pages: usize) {
        *self.fail_after_pages.lock().unwrap() = Some(pages);
    }

    /// Every later page request never completes.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContentSource for MemorySource {
    async fn history_page(
        &self,
        location: &Location,
        cursor: HistoryCursor,
        limit: usize,
    ) -> Result<HistoryPage, SourceError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let channel = location.target_channel();
        if self.missing.lock().unwrap().contains(&channel) {
            return Err(SourceError::NotFound(location.to_string()));
        }
        let served = self.pages_served.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = *self.fail_after_pages.lock().unwrap() {
            if served >= limit {
                return Err(SourceError::Transient("connection reset".into()));
            }
        }

        let history = self.history.lock().unwrap();
        let messages = history
            .get(&channel)
            .map(|all| {
                all.iter()
                    .filter(|m| match cursor {
                        HistoryCursor::Start => true,
                        HistoryCursor::After(at) => m.created_at > at,
                        HistoryCursor::AfterMessage(id) => m.id > id,
                    })
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(HistoryPage {
            messages,
            limits: None,
        })
    }
}

/// Serves bytes by URL; unknown URLs answer 404.
#[derive(Default)]
pub struct MemoryFetcher {
    bodies: Mutex<HashMap<String, Bytes>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, body: impl Into<Bytes>) {
        self.bodies.lock().unwrap().insert(url.to_string(), body.into());
    }
}

#[async_trait]
impl AttachmentFetcher for MemoryFetcher {
    async fn fetch(&self, url: &str, max_size: u64) -> Result<Bytes, FetchError> {
        let body = self
            .bodies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                status: 404,
                url: url.to_string(),
            })?;
        if body.len() as u64 > max_size {
            return Err(FetchError::TooLarge {
                size: body.len() as u64,
                limit: max_size,
            });
        }
        Ok(body)
    }
}

/// Keeps stored objects in a map; paths containing a registered fragment
/// fail with a 507.
#[derive(Default)]
pub struct MemorySink {
    pub objects: Mutex<HashMap<String, Bytes>>,
    failing: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_paths_containing(&self, fragment: &str) {
        self.failing.lock().unwrap().push(fragment.to_string());
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl StorageSink for MemorySink {
    async fn put(&self, bytes: Bytes, logical_path: &str) -> Result<String, StorageError> {
        if self
            .failing
            .lock()
            .unwrap()
            .iter()
            .any(|f| logical_path.contains(f.as_str()))
        {
            return Err(StorageError::Status {
                status: 507,
                path: logical_path.to_string(),
            });
        }
        self.objects
            .lock()
            .unwrap()
            .insert(logical_path.to_string(), bytes);
        Ok(format!("mem://{}", logical_path))
    }
}
