use std::time::Duration;
use thiserror::Error;

/// Failures reported by the remote content source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The guild, channel or thread no longer exists (or is not visible).
    #[error("location not found: {0}")]
    NotFound(String),
    #[error("rate limited, retry after {retry_after:?} (global: {global})")]
    RateLimited { retry_after: Duration, global: bool },
    #[error("transient network error: {0}")]
    Transient(String),
    #[error("content source error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} while fetching {url}")]
    Status { status: u16, url: String },
    #[error("attachment is {size} bytes, above the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend returned HTTP {status} for {path}")]
    Status { status: u16, path: String },
    #[error("storage request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("backup config {0} not found")]
    ConfigNotFound(i64),
    #[error("attachment '{filename}' is {size} bytes, above the {limit} byte volume limit")]
    AttachmentTooLarge {
        filename: String,
        size: u64,
        limit: u64,
    },
    #[error("manifest is {size} bytes, above the {limit} byte volume limit")]
    ManifestTooLarge { size: u64, limit: u64 },
    #[error("failed to write volume: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to write volume: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("gave up reconnecting after {attempts} attempts, last error: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// A webhook payload that cannot become a `Notification`.
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported event_type '{0}'")]
    EventType(String),
    #[error("timestamp '{0}' is not ISO 8601")]
    Timestamp(String),
    #[error("field {field} is not a numeric id: '{value}'")]
    Id { field: &'static str, value: String },
}
