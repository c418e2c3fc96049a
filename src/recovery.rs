//! Catch-up synchronization after downtime.

use crate::db::Database;
use crate::sync::HistorySynchronizer;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_THRESHOLD: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No activity was ever recorded.
    FirstStart,
    /// The process was down for less than the threshold.
    ShortDowntime(Duration),
    NoConfigs,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub succeeded: usize,
    pub failed: usize,
    pub scanned: usize,
    pub archived: usize,
    /// `(config id, error)` for every failed config.
    pub errors: Vec<(i64, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Skipped(SkipReason),
    Completed(RecoveryReport),
}

pub struct RecoveryCoordinator {
    db: Database,
    sync: HistorySynchronizer,
    threshold: Duration,
}

impl RecoveryCoordinator {
    pub fn new(db: Database, sync: HistorySynchronizer, threshold: Duration) -> Self {
        Self {
            db,
            sync,
            threshold,
        }
    }

    /// Rescans every enabled config from the later of its checkpoint and the
    /// last recorded activity. One task per config; a failing config is
    /// reported and never cancels its siblings.
    pub async fn run(&self, now: DateTime<Utc>) -> anyhow::Result<RecoveryOutcome> {
        let last_activity = self.db.run_blocking(|db| db.last_activity()).await?;
        self.recover(last_activity, now).await
    }

    /// Same as `run`, with the last activity time captured earlier (before
    /// new traffic could overwrite it).
    pub async fn recover(
        &self,
        last_activity: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RecoveryOutcome> {
        let Some(last_activity) = last_activity else {
            info!("Recovery: no recorded activity, skipping (first start)");
            return Ok(RecoveryOutcome::Skipped(SkipReason::FirstStart));
        };

        let downtime = (now - last_activity).to_std().unwrap_or(Duration::ZERO);
        if downtime < self.threshold {
            info!(
                "Recovery: down for {}, below threshold {}, skipping",
                humantime::format_duration(round_secs(downtime)),
                humantime::format_duration(self.threshold)
            );
            return Ok(RecoveryOutcome::Skipped(SkipReason::ShortDowntime(downtime)));
        }

        let configs = self.db.run_blocking(|db| db.list_enabled_configs()).await?;
        if configs.is_empty() {
            info!("Recovery: no enabled backup configs");
            return Ok(RecoveryOutcome::Skipped(SkipReason::NoConfigs));
        }

        info!(
            "Recovery: down for {} (last activity {}), rescanning {} configs",
            humantime::format_duration(round_secs(downtime)),
            last_activity,
            configs.len()
        );

        let mut handles = Vec::with_capacity(configs.len());
        for config in configs {
            let resume_from = match config.last_check_time {
                Some(checkpoint) => checkpoint.max(last_activity),
                None => last_activity,
            };
            let sync = self.sync.clone();
            let config_id = config.id;
            let handle = tokio::spawn(async move { sync.run(&config, Some(resume_from)).await });
            handles.push((config_id, handle));
        }

        let mut report = RecoveryReport::default();
        for (config_id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(e) => Err(format!("recovery task aborted: {}", e)),
            };
            match result {
                Ok(sync_report) => {
                    report.scanned += sync_report.scanned;
                    report.archived += sync_report.archived;
                    if sync_report.is_complete() {
                        report.succeeded += 1;
                    } else {
                        let e = format!("{} messages could not be stored", sync_report.failed);
                        warn!("Recovery: config {} incomplete: {}", config_id, e);
                        report.failed += 1;
                        report.errors.push((config_id, e));
                    }
                }
                Err(e) => {
                    warn!("Recovery: config {} failed: {}", config_id, e);
                    report.failed += 1;
                    report.errors.push((config_id, e));
                }
            }
        }

        info!(
            "Recovery: finished, {} succeeded, {} failed, {} messages archived",
            report.succeeded, report.failed, report.archived
        );
        Ok(RecoveryOutcome::Completed(report))
    }
}

fn round_secs(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::{Archiver, AttachmentPolicy};
    use crate::model::Location;
    use crate::rate_limit::RateLimiter;
    use crate::testing::{memory_db, message, MemoryFetcher, MemorySink, MemorySource};
    use std::sync::Arc;

    fn coordinator(db: &Database, source: Arc<MemorySource>) -> RecoveryCoordinator {
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
        RecoveryCoordinator::new(db.clone(), sync, DEFAULT_THRESHOLD)
    }

    #[tokio::test]
    async fn test_skips_without_activity_or_short_downtime() {
        let db = memory_db();
        let recovery = coordinator(&db, Arc::new(MemorySource::new()));
        let now = Utc::now();

        assert_eq!(
            recovery.run(now).await.unwrap(),
            RecoveryOutcome::Skipped(SkipReason::FirstStart)
        );

        db.record_activity(now - chrono::Duration::seconds(60)).unwrap();
        assert!(matches!(
            recovery.run(now).await.unwrap(),
            RecoveryOutcome::Skipped(SkipReason::ShortDowntime(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_config_does_not_block_siblings() {
        let db = memory_db();
        let now = Utc::now();
        let last_activity = now - chrono::Duration::hours(2);
        db.record_activity(last_activity).unwrap();

        let valid = Location::channel(1, 2);
        let deleted = Location::channel(1, 3);
        let source = Arc::new(MemorySource::new());
        // Before the downtime window: not rescanned.
        source.push(message(1, valid, 7, last_activity - chrono::Duration::minutes(1)));
        source.push(message(2, valid, 7, last_activity + chrono::Duration::minutes(1)));
        source.push(message(3, valid, 7, last_activity + chrono::Duration::minutes(2)));
        source.mark_missing(&deleted);

        let x = db.create_backup_config(&valid, 7, None).unwrap();
        let y = db.create_backup_config(&deleted, 7, None).unwrap();

        let outcome = coordinator(&db, source).run(now).await.unwrap();
        let RecoveryOutcome::Completed(report) = outcome else {
            panic!("expected recovery to run, got {:?}", outcome);
        };
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.archived, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, y);

        assert_eq!(db.messages_for_config(x).unwrap().len(), 2);
        assert!(db.get_config(x).unwrap().unwrap().last_check_time.is_some());
        assert!(db.get_config(y).unwrap().unwrap().last_check_time.is_none());
    }

    #[tokio::test]
    async fn test_resume_point_prefers_later_checkpoint() {
        let db = memory_db();
        let now = Utc::now();
        let last_activity = now - chrono::Duration::hours(2);
        db.record_activity(last_activity).unwrap();

        let location = Location::channel(1, 2);
        let checkpoint = last_activity + chrono::Duration::minutes(30);
        let source = Arc::new(MemorySource::new());
        source.push(message(1, location, 7, last_activity + chrono::Duration::minutes(10)));
        source.push(message(2, location, 7, checkpoint + chrono::Duration::minutes(10)));

        let id = db.create_backup_config(&location, 7, None).unwrap();
        db.advance_checkpoint(id, checkpoint).unwrap();

        coordinator(&db, source).run(now).await.unwrap();
        let archived: Vec<u64> = db
            .messages_for_config(id)
            .unwrap()
            .iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(archived, vec![2]);
    }
}
