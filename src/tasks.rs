//! Pending scan-task queue worker.

use crate::db::{Database, ScanTaskStatus};
use crate::sync::HistorySynchronizer;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const BATCH_SIZE: usize = 20;

/// Runs one scan task to completion. A task that is not pending any more
/// (claimed elsewhere, or already finished) is left alone.
pub async fn execute_scan_task(
    db: &Database,
    sync: &HistorySynchronizer,
    task_id: i64,
) -> anyhow::Result<Option<ScanTaskStatus>> {
    if !db.run_blocking(move |db| db.claim_scan_task(task_id)).await? {
        debug!("ScanTasks: task {} already claimed", task_id);
        return Ok(None);
    }

    let config = db
        .run_blocking(move |db| {
            let Some(task) = db.get_scan_task(task_id)? else {
                return Ok(None);
            };
            db.get_config(task.config_id)
        })
        .await?;

    let (status, error) = match config {
        Some(config) if config.enabled => match sync.run(&config, None).await {
            Ok(report) if !report.is_complete() => (
                ScanTaskStatus::Failed,
                Some(format!("{} messages could not be stored", report.failed)),
            ),
            Ok(report) => {
                info!(
                    "ScanTasks: task {} done, scanned {}, archived {}",
                    task_id, report.scanned, report.archived
                );
                (ScanTaskStatus::Completed, None)
            }
            Err(e) => (ScanTaskStatus::Failed, Some(e.to_string())),
        },
        Some(_) => (
            ScanTaskStatus::Failed,
            Some("backup config is disabled".to_string()),
        ),
        None => (
            ScanTaskStatus::Failed,
            Some("backup config no longer exists".to_string()),
        ),
    };

    if let Some(e) = &error {
        warn!("ScanTasks: task {} failed: {}", task_id, e);
    }
    db.run_blocking(move |db| db.set_scan_task_status(task_id, status, error.as_deref()))
        .await?;
    Ok(Some(status))
}

pub struct ScanTaskWorker {
    db: Database,
    sync: HistorySynchronizer,
    interval: Duration,
}

impl ScanTaskWorker {
    pub fn new(db: Database, sync: HistorySynchronizer, interval: Duration) -> Self {
        Self { db, sync, interval }
    }

    pub async fn run(self, cancel: CancellationToken) {
        match self
            .db
            .run_blocking(|db| db.requeue_interrupted_scan_tasks())
            .await
        {
            Ok(0) => {}
            Ok(n) => info!("ScanTasks: re-queued {} interrupted tasks", n),
            Err(e) => error!("ScanTasks: failed to re-queue interrupted tasks: {}", e),
        }

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("ScanTasks: shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    // A claimed task cut short here stays in progress and is
                    // re-queued on the next start.
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("ScanTasks: shutting down mid-cycle");
                            break;
                        }
                        result = self.process_pending() => match result {
                            Ok(0) => debug!("ScanTasks: nothing pending"),
                            Ok(n) => info!("ScanTasks: processed {} tasks", n),
                            Err(e) => error!("ScanTasks: cycle failed: {}", e),
                        },
                    }
                }
            }
        }
    }

    async fn process_pending(&self) -> anyhow::Result<usize> {
        let pending = self
            .db
            .run_blocking(|db| db.pending_scan_tasks(BATCH_SIZE))
            .await?;
        let mut processed = 0;
        for task in pending {
            if execute_scan_task(&self.db, &self.sync, task.id).await?.is_some() {
                processed += 1;
            }
        }
        Ok(processed)
    }
}
