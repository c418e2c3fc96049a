pub mod schema;

use crate::config::Config;
use crate::model::{ContentType, Location};
use anyhow::anyhow;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

const TS_WRITE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const TS_READ_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_WRITE_FORMAT).to_string()
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, TS_READ_FORMAT).ok()?;
    Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupConfig {
    pub id: i64,
    pub location: Location,
    pub author_id: u64,
    pub title: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    /// Checkpoint: history up to here has been synchronized.
    pub last_check_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageBackupRecord {
    pub id: i64,
    pub config_id: i64,
    pub message_id: u64,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub backup_time: DateTime<Utc>,
    pub content_type: ContentType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileBackupRecord {
    pub id: i64,
    pub message_backup_id: i64,
    pub original_filename: String,
    pub stored_location: String,
    pub file_size: u64,
    pub source_url: String,
    pub backup_time: DateTime<Utc>,
}

pub struct NewFileBackup<'a> {
    pub message_backup_id: i64,
    pub original_filename: &'a str,
    pub stored_location: &'a str,
    pub file_size: u64,
    pub source_url: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ScanTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanTaskRecord {
    pub id: i64,
    pub config_id: i64,
    pub status: ScanTaskStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupStats {
    /// Only filled for global stats.
    pub config_count: Option<usize>,
    pub message_count: usize,
    pub file_count: usize,
    pub total_size: u64,
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        if config.database_url != ":memory:" {
            if let Some(parent) = std::path::Path::new(&config.database_url).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        Self::open(&config.database_url)
    }

    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> anyhow::Result<()> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    /// Runs a synchronous database closure on the blocking pool so async
    /// callers never stall the scheduler on SQLite.
    pub async fn run_blocking<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    pub fn execute_init(&self) -> anyhow::Result<()> {
        info!("Database: Initializing schema...");
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(schema::SCHEMA)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    // --- Backup configs ---

    /// Idempotent: an enabled row is returned as-is, a disabled row is
    /// re-enabled, otherwise a new row is inserted.
    pub fn create_backup_config(
        &self,
        location: &Location,
        author_id: u64,
        title: Option<&str>,
    ) -> anyhow::Result<i64> {
        let conn = self.conn()?;
        let existing: Option<(i64, bool)> = conn
            .query_row(
                "SELECT id, enabled FROM backup_configs
                 WHERE guild_id = ?1 AND channel_id = ?2 AND thread_id IS ?3 AND author_id = ?4",
                params![
                    location.guild_id.to_string(),
                    location.channel_id.to_string(),
                    location.thread_id.map(|t| t.to_string()),
                    author_id.to_string()
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            Some((id, true)) => {
                debug!("Database: Backup config {} already enabled", id);
                Ok(id)
            }
            Some((id, false)) => {
                conn.execute(
                    "UPDATE backup_configs SET enabled = TRUE, title = COALESCE(?2, title) WHERE id = ?1",
                    params![id, title],
                )?;
                info!("Database: Re-enabled backup config {}", id);
                Ok(id)
            }
            None => {
                conn.execute(
                    "INSERT INTO backup_configs (guild_id, channel_id, thread_id, author_id, title, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        location.guild_id.to_string(),
                        location.channel_id.to_string(),
                        location.thread_id.map(|t| t.to_string()),
                        author_id.to_string(),
                        title,
                        format_ts(Utc::now())
                    ],
                )?;
                let id = conn.last_insert_rowid();
                info!("Database: Created backup config {} for {} / author {}", id, location, author_id);
                Ok(id)
            }
        }
    }

    pub fn disable_backup_config(&self, config_id: i64) -> anyhow::Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE backup_configs SET enabled = FALSE WHERE id = ?1",
            [config_id],
        )?;
        Ok(changed > 0)
    }

    /// Looks up the config for an identity tuple, enabled or not.
    pub fn get_backup_config(
        &self,
        location: &Location,
        author_id: u64,
    ) -> anyhow::Result<Option<BackupConfig>> {
        let conn = self.conn()?;
        let config = conn
            .query_row(
                "SELECT id, guild_id, channel_id, thread_id, author_id, title, enabled, created_at, last_check_time
                 FROM backup_configs
                 WHERE guild_id = ?1 AND channel_id = ?2 AND thread_id IS ?3 AND author_id = ?4",
                params![
                    location.guild_id.to_string(),
                    location.channel_id.to_string(),
                    location.thread_id.map(|t| t.to_string()),
                    author_id.to_string()
                ],
                config_from_row,
            )
            .optional()?;
        Ok(config)
    }

    pub fn get_config(&self, config_id: i64) -> anyhow::Result<Option<BackupConfig>> {
        let conn = self.conn()?;
        let config = conn
            .query_row(
                "SELECT id, guild_id, channel_id, thread_id, author_id, title, enabled, created_at, last_check_time
                 FROM backup_configs WHERE id = ?1",
                [config_id],
                config_from_row,
            )
            .optional()?;
        Ok(config)
    }

    pub fn list_enabled_configs(&self) -> anyhow::Result<Vec<BackupConfig>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, guild_id, channel_id, thread_id, author_id, title, enabled, created_at, last_check_time
             FROM backup_configs WHERE enabled = TRUE ORDER BY id",
        )?;
        let rows = stmt.query_map([], config_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_configs_by_author(&self, author_id: u64) -> anyhow::Result<Vec<BackupConfig>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, guild_id, channel_id, thread_id, author_id, title, enabled, created_at, last_check_time
             FROM backup_configs WHERE author_id = ?1 AND enabled = TRUE ORDER BY id",
        )?;
        let rows = stmt.query_map([author_id.to_string()], config_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn update_config_title(&self, config_id: i64, title: &str) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE backup_configs SET title = ?2 WHERE id = ?1",
            params![config_id, title],
        )?;
        Ok(())
    }

    /// Moves the checkpoint forward. Returns false when `at` is not newer
    /// than the stored value; the checkpoint never rewinds.
    pub fn advance_checkpoint(&self, config_id: i64, at: DateTime<Utc>) -> anyhow::Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE backup_configs SET last_check_time = ?2
             WHERE id = ?1 AND (last_check_time IS NULL OR last_check_time < ?2)",
            params![config_id, format_ts(at)],
        )?;
        Ok(changed > 0)
    }

    /// Removes a config with all of its messages, files and scan tasks in
    /// one transaction.
    pub fn delete_backup_config(&self, config_id: i64) -> anyhow::Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM file_backups WHERE message_backup_id IN
                (SELECT id FROM message_backups WHERE config_id = ?1)",
            [config_id],
        )?;
        tx.execute("DELETE FROM message_backups WHERE config_id = ?1", [config_id])?;
        tx.execute("DELETE FROM scan_tasks WHERE config_id = ?1", [config_id])?;
        let deleted = tx.execute("DELETE FROM backup_configs WHERE id = ?1", [config_id])?;
        tx.commit()?;
        info!("Database: Deleted backup config {} (found: {})", config_id, deleted > 0);
        Ok(deleted > 0)
    }

    // --- Message & file backups ---

    /// Inserts a message backup keyed by message id. `None` means the
    /// message was already archived.
    pub fn insert_message_backup(
        &self,
        config_id: i64,
        message_id: u64,
        content: &str,
        created_at: DateTime<Utc>,
        content_type: ContentType,
    ) -> anyhow::Result<Option<i64>> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO message_backups (config_id, message_id, content, created_at, backup_time, content_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(message_id) DO NOTHING",
            params![
                config_id,
                message_id.to_string(),
                content,
                format_ts(created_at),
                format_ts(Utc::now()),
                content_type.as_str()
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    pub fn message_backup_exists(&self, message_id: u64) -> anyhow::Result<bool> {
        let conn = self.conn()?;
        let exists = conn
            .prepare("SELECT 1 FROM message_backups WHERE message_id = ?1")?
            .exists([message_id.to_string()])?;
        Ok(exists)
    }

    pub fn update_message_content(&self, message_id: u64, content: &str) -> anyhow::Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE message_backups SET content = ?2, backup_time = ?3 WHERE message_id = ?1",
            params![message_id.to_string(), content, format_ts(Utc::now())],
        )?;
        Ok(changed > 0)
    }

    pub fn insert_file_backup(&self, file: &NewFileBackup<'_>) -> anyhow::Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO file_backups (message_backup_id, original_filename, stored_location, file_size, source_url, backup_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                file.message_backup_id,
                file.original_filename,
                file.stored_location,
                file.file_size as i64,
                file.source_url,
                format_ts(Utc::now())
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn messages_for_config(&self, config_id: i64) -> anyhow::Result<Vec<MessageBackupRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, config_id, message_id, content, created_at, backup_time, content_type
             FROM message_backups WHERE config_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([config_id], |row| {
            let content_type: String = row.get(6)?;
            Ok(MessageBackupRecord {
                id: row.get(0)?,
                config_id: row.get(1)?,
                message_id: id_column(row, 2)?,
                content: row.get(3)?,
                created_at: ts_column(row, 4)?,
                backup_time: ts_column(row, 5)?,
                content_type: ContentType::parse(&content_type),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Files of a config in original order: by message, then by insertion.
    pub fn files_for_config(&self, config_id: i64) -> anyhow::Result<Vec<FileBackupRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT fb.id, fb.message_backup_id, fb.original_filename, fb.stored_location,
                    fb.file_size, fb.source_url, fb.backup_time
             FROM file_backups fb
             JOIN message_backups mb ON fb.message_backup_id = mb.id
             WHERE mb.config_id = ?1
             ORDER BY mb.created_at ASC, mb.id ASC, fb.id ASC",
        )?;
        let rows = stmt.query_map([config_id], |row| {
            let size: i64 = row.get(4)?;
            Ok(FileBackupRecord {
                id: row.get(0)?,
                message_backup_id: row.get(1)?,
                original_filename: row.get(2)?,
                stored_location: row.get(3)?,
                file_size: size.max(0) as u64,
                source_url: row.get(5)?,
                backup_time: ts_column(row, 6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn backup_stats(&self, config_id: Option<i64>) -> anyhow::Result<BackupStats> {
        let conn = self.conn()?;
        match config_id {
            Some(id) => {
                let message_count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM message_backups WHERE config_id = ?1",
                    [id],
                    |row| row.get(0),
                )?;
                let (file_count, total_size): (i64, i64) = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(fb.file_size), 0)
                     FROM file_backups fb
                     JOIN message_backups mb ON fb.message_backup_id = mb.id
                     WHERE mb.config_id = ?1",
                    [id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Ok(BackupStats {
                    config_count: None,
                    message_count: message_count as usize,
                    file_count: file_count as usize,
                    total_size: total_size.max(0) as u64,
                })
            }
            None => {
                let config_count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM backup_configs WHERE enabled = TRUE",
                    [],
                    |row| row.get(0),
                )?;
                let message_count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM message_backups", [], |row| row.get(0))?;
                let (file_count, total_size): (i64, i64) = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(file_size), 0) FROM file_backups",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Ok(BackupStats {
                    config_count: Some(config_count as usize),
                    message_count: message_count as usize,
                    file_count: file_count as usize,
                    total_size: total_size.max(0) as u64,
                })
            }
        }
    }

    // --- Bot status ---

    pub fn record_activity(&self, at: DateTime<Utc>) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO bot_status (id, last_activity_time) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET last_activity_time = ?1",
            [format_ts(at)],
        )?;
        Ok(())
    }

    pub fn last_activity(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT last_activity_time FROM bot_status WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.flatten().as_deref().and_then(parse_ts))
    }

    // --- Scan tasks ---

    pub fn create_scan_task(&self, config_id: i64) -> anyhow::Result<i64> {
        let conn = self.conn()?;
        let now = format_ts(Utc::now());
        conn.execute(
            "INSERT INTO scan_tasks (config_id, status, created_at, updated_at) VALUES (?1, 'pending', ?2, ?2)",
            params![config_id, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn pending_scan_tasks(&self, limit: usize) -> anyhow::Result<Vec<ScanTaskRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, config_id, status, error, created_at FROM scan_tasks
             WHERE status = 'pending' ORDER BY created_at ASC, id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            let status: String = row.get(2)?;
            Ok(ScanTaskRecord {
                id: row.get(0)?,
                config_id: row.get(1)?,
                status: ScanTaskStatus::parse(&status),
                error: row.get(3)?,
                created_at: ts_column(row, 4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_scan_task(&self, task_id: i64) -> anyhow::Result<Option<ScanTaskRecord>> {
        let conn = self.conn()?;
        let task = conn
            .query_row(
                "SELECT id, config_id, status, error, created_at FROM scan_tasks WHERE id = ?1",
                [task_id],
                |row| {
                    let status: String = row.get(2)?;
                    Ok(ScanTaskRecord {
                        id: row.get(0)?,
                        config_id: row.get(1)?,
                        status: ScanTaskStatus::parse(&status),
                        error: row.get(3)?,
                        created_at: ts_column(row, 4)?,
                    })
                },
            )
            .optional()?;
        Ok(task)
    }

    /// Claims a pending task. Returns false if someone else already took it.
    pub fn claim_scan_task(&self, task_id: i64) -> anyhow::Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE scan_tasks SET status = 'in_progress', updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![task_id, format_ts(Utc::now())],
        )?;
        Ok(changed > 0)
    }

    pub fn set_scan_task_status(
        &self,
        task_id: i64,
        status: ScanTaskStatus,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE scan_tasks SET status = ?2, error = ?3, updated_at = ?4 WHERE id = ?1",
            params![task_id, status.as_str(), error, format_ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Puts tasks interrupted by a crash back into the queue.
    pub fn requeue_interrupted_scan_tasks(&self) -> anyhow::Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE scan_tasks SET status = 'pending', updated_at = ?1 WHERE status = 'in_progress'",
            [format_ts(Utc::now())],
        )?;
        Ok(count)
    }
}

fn id_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid timestamp '{}'", raw).into(),
        )
    })
}

fn config_from_row(row: &Row<'_>) -> rusqlite::Result<BackupConfig> {
    let thread: Option<String> = row.get(3)?;
    let thread_id = match thread {
        Some(raw) => Some(raw.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
        })?),
        None => None,
    };
    let last_check: Option<String> = row.get(8)?;
    Ok(BackupConfig {
        id: row.get(0)?,
        location: Location {
            guild_id: id_column(row, 1)?,
            channel_id: id_column(row, 2)?,
            thread_id,
        },
        author_id: id_column(row, 4)?,
        title: row.get(5)?,
        enabled: row.get(6)?,
        created_at: ts_column(row, 7)?,
        last_check_time: last_check.as_deref().and_then(parse_ts),
    })
}
