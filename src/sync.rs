//! Incremental, checkpointed scanning of one location's history.

use crate::archiver::{Archiver, PersistOutcome};
use crate::db::{BackupConfig, Database};
use crate::error::SourceError;
use crate::rate_limit::RateLimiter;
use crate::source::{ContentSource, HistoryCursor};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const PAGE_SIZE: usize = 100;
const YIELD_EVERY: usize = 25;
const YIELD_FOR: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Scanning,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Every item read from the source, whatever its author.
    pub scanned: usize,
    /// Items newly archived by this run.
    pub archived: usize,
    /// Items by the config's author that could not be stored.
    pub failed: usize,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("failed to archive: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct HistorySynchronizer {
    db: Database,
    source: Arc<dyn ContentSource>,
    limiter: RateLimiter,
    archiver: Archiver,
    states: Arc<Mutex<HashMap<i64, SyncState>>>,
    page_size: usize,
    yield_every: usize,
    yield_for: Duration,
}

impl HistorySynchronizer {
    pub fn new(
        db: Database,
        source: Arc<dyn ContentSource>,
        limiter: RateLimiter,
        archiver: Archiver,
    ) -> Self {
        Self {
            db,
            source,
            limiter,
            archiver,
            states: Arc::new(Mutex::new(HashMap::new())),
            page_size: PAGE_SIZE,
            yield_every: YIELD_EVERY,
            yield_for: YIELD_FOR,
        }
    }

    pub fn with_pacing(mut self, page_size: usize, yield_every: usize, yield_for: Duration) -> Self {
        self.page_size = page_size.max(1);
        self.yield_every = yield_every.max(1);
        self.yield_for = yield_for;
        self
    }

    pub fn state(&self, config_id: i64) -> SyncState {
        self.states
            .lock()
            .map(|states| states.get(&config_id).copied().unwrap_or(SyncState::Idle))
            .unwrap_or(SyncState::Idle)
    }

    fn set_state(&self, config_id: i64, state: SyncState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(config_id, state);
        }
    }

    /// Scans `config`'s location strictly after `resume_from` (or the
    /// config's checkpoint), archiving the config author's messages.
    ///
    /// The checkpoint moves to the completion time of the scan only when
    /// every page was read and every message stored; otherwise it is left
    /// untouched so the same window is scanned again next time. Messages
    /// that fail to store are counted in the report, not returned as errors.
    pub async fn run(
        &self,
        config: &BackupConfig,
        resume_from: Option<DateTime<Utc>>,
    ) -> Result<SyncReport, SyncError> {
        self.set_state(config.id, SyncState::Scanning);
        let result = self.scan(config, resume_from).await;

        match result {
            Ok(report) if !report.is_complete() => {
                self.set_state(config.id, SyncState::Failed);
                warn!(
                    "Sync: config {} ({}) finished with {} unstored messages, checkpoint kept",
                    config.id, config.location, report.failed
                );
                Ok(report)
            }
            Ok(report) => {
                let config_id = config.id;
                let completed_at = Utc::now();
                let advanced = self
                    .db
                    .run_blocking(move |db| db.advance_checkpoint(config_id, completed_at))
                    .await;
                match advanced {
                    Ok(_) => {
                        self.set_state(config.id, SyncState::Completed);
                        info!(
                            "Sync: config {} ({}) done, scanned {}, archived {}",
                            config.id, config.location, report.scanned, report.archived
                        );
                        Ok(report)
                    }
                    Err(e) => {
                        self.set_state(config.id, SyncState::Failed);
                        Err(SyncError::Store(e))
                    }
                }
            }
            Err(e) => {
                self.set_state(config.id, SyncState::Failed);
                warn!(
                    "Sync: config {} ({}) failed, checkpoint kept: {}",
                    config.id, config.location, e
                );
                Err(e)
            }
        }
    }

    async fn scan(
        &self,
        config: &BackupConfig,
        resume_from: Option<DateTime<Utc>>,
    ) -> Result<SyncReport, SyncError> {
        let location = config.location;
        let route = RateLimiter::history_route(location.target_channel());
        let mut cursor = match resume_from.or(config.last_check_time) {
            Some(at) => HistoryCursor::After(at),
            None => HistoryCursor::Start,
        };
        debug!("Sync: config {} starting at {:?}", config.id, cursor);

        let mut report = SyncReport::default();
        loop {
            let source = &self.source;
            let location = &location;
            let page_size = self.page_size;
            let page = self
                .limiter
                .call(&route, move || {
                    source.history_page(location, cursor, page_size)
                })
                .await?;
            if let Some(limits) = &page.limits {
                self.limiter.observe(&route, limits);
            }

            let fetched = page.messages.len();
            for message in &page.messages {
                report.scanned += 1;
                cursor = HistoryCursor::AfterMessage(message.id);

                if message.author_id == config.author_id {
                    match self.archiver.persist(config, message).await {
                        Ok(PersistOutcome::Archived(_)) => report.archived += 1,
                        Ok(PersistOutcome::AlreadyExists) => {}
                        Err(e) => {
                            warn!(
                                "Sync: config {} could not store message {}: {}",
                                config.id, message.id, e
                            );
                            report.failed += 1;
                        }
                    }
                }

                if report.scanned % self.yield_every == 0 {
                    tokio::time::sleep(self.yield_for).await;
                }
            }

            if fetched < self.page_size {
                break;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::AttachmentPolicy;
    use crate::model::Location;
    use crate::testing::{
        memory_db, message, reject_message_insert, MemoryFetcher, MemorySink, MemorySource,
    };
    use chrono::TimeZone;

    const AUTHOR_A: u64 = 10;
    const AUTHOR_B: u64 = 20;

    fn synchronizer(db: &Database, source: Arc<MemorySource>) -> HistorySynchronizer {
        let archiver = Archiver::new(
            db.clone(),
            Arc::new(MemoryFetcher::new()),
            Arc::new(MemorySink::new()),
            AttachmentPolicy {
                allowed_extensions: vec!["txt".into()],
                max_file_size: 1024,
            },
        );
        HistorySynchronizer::new(db.clone(), source, RateLimiter::new(), archiver).with_pacing(
            2,
            2,
            Duration::ZERO,
        )
    }

    fn config_with_checkpoint(db: &Database, location: Location, at: Option<DateTime<Utc>>) -> BackupConfig {
        let id = db.create_backup_config(&location, AUTHOR_A, None).unwrap();
        if let Some(at) = at {
            db.advance_checkpoint(id, at).unwrap();
        }
        db.get_config(id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_scan_filters_author_and_advances_to_completion_time() {
        let db = memory_db();
        let location = Location::channel(1, 2);
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let source = Arc::new(MemorySource::new());
        source.push(message(1, location, AUTHOR_A, t0 + chrono::Duration::seconds(1)));
        source.push(message(2, location, AUTHOR_B, t0 + chrono::Duration::seconds(2)));
        source.push(message(3, location, AUTHOR_A, t0 + chrono::Duration::seconds(3)));
        // At or before the checkpoint: never seen.
        source.push(message(0, location, AUTHOR_A, t0));

        let config = config_with_checkpoint(&db, location, Some(t0));
        let sync = synchronizer(&db, source);
        let before = Utc::now();
        let report = sync.run(&config, None).await.unwrap();

        assert_eq!(report, SyncReport { scanned: 3, archived: 2, failed: 0 });
        assert_eq!(sync.state(config.id), SyncState::Completed);

        let archived: Vec<u64> = db
            .messages_for_config(config.id)
            .unwrap()
            .iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(archived, vec![1, 3]);

        let checkpoint = db.get_config(config.id).unwrap().unwrap().last_check_time.unwrap();
        assert!(checkpoint >= before - chrono::Duration::milliseconds(1));
        assert!(checkpoint > t0 + chrono::Duration::seconds(3));
    }

    #[tokio::test]
    async fn test_rescan_is_idempotent() {
        let db = memory_db();
        let location = Location::channel(1, 2);
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let source = Arc::new(MemorySource::new());
        for i in 1..=5 {
            source.push(message(i, location, AUTHOR_A, t0 + chrono::Duration::seconds(i as i64)));
        }
        let config = config_with_checkpoint(&db, location, None);
        let sync = synchronizer(&db, source);

        let first = sync.run(&config, Some(t0)).await.unwrap();
        let second = sync.run(&config, Some(t0)).await.unwrap();
        assert_eq!(first.archived, 5);
        assert_eq!(second, SyncReport { scanned: 5, archived: 0, failed: 0 });
        assert_eq!(db.messages_for_config(config.id).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_failed_scan_keeps_checkpoint() {
        let db = memory_db();
        let location = Location::channel(1, 2);
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let source = Arc::new(MemorySource::new());
        for i in 1..=6 {
            source.push(message(i, location, AUTHOR_A, t0 + chrono::Duration::seconds(i as i64)));
        }
        // Page size 2: the first page succeeds, the second fails.
        source.fail_after_pages(1);
        let config = config_with_checkpoint(&db, location, Some(t0));
        let sync = synchronizer(&db, source);

        let err = sync.run(&config, None).await.unwrap_err();
        assert!(matches!(err, SyncError::Source(SourceError::Transient(_))));
        assert_eq!(sync.state(config.id), SyncState::Failed);
        assert_eq!(
            db.get_config(config.id).unwrap().unwrap().last_check_time,
            Some(t0)
        );
        // Work done before the failure is kept.
        assert_eq!(db.messages_for_config(config.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_location_reports_not_found() {
        let db = memory_db();
        let location = Location::thread(1, 2, 3);
        let source = Arc::new(MemorySource::new());
        source.mark_missing(&location);
        let config = config_with_checkpoint(&db, location, None);

        let err = synchronizer(&db, source).run(&config, None).await.unwrap_err();
        assert!(matches!(err, SyncError::Source(SourceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unstored_message_does_not_stop_scan() {
        let db = memory_db();
        let location = Location::channel(1, 2);
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let source = Arc::new(MemorySource::new());
        for i in 1..=3 {
            source.push(message(i, location, AUTHOR_A, t0 + chrono::Duration::seconds(i as i64)));
        }
        reject_message_insert(&db, 2, "disk full");
        let config = config_with_checkpoint(&db, location, Some(t0));
        let sync = synchronizer(&db, source);

        let report = sync.run(&config, None).await.unwrap();
        assert_eq!(report, SyncReport { scanned: 3, archived: 2, failed: 1 });
        assert_eq!(sync.state(config.id), SyncState::Failed);

        let archived: Vec<u64> = db
            .messages_for_config(config.id)
            .unwrap()
            .iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(archived, vec![1, 3]);
        assert_eq!(
            db.get_config(config.id).unwrap().unwrap().last_check_time,
            Some(t0)
        );
    }
}
