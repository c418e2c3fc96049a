//! Remote content source: paged message history per location.

use crate::error::SourceError;
use crate::model::{Location, SourceAttachment, SourceMessage};
use crate::rate_limit::LimitInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::all::{ChannelId, GetMessages, Http, Message, MessageId};
use std::sync::Arc;
use std::time::Duration;

/// Discord snowflake epoch (2015-01-01T00:00:00Z) in milliseconds.
const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;

/// Where a page of history starts (exclusive).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HistoryCursor {
    /// From the very beginning of the location.
    Start,
    /// Strictly after this instant.
    After(DateTime<Utc>),
    /// Strictly after this message id.
    AfterMessage(u64),
}

#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    /// Oldest first.
    pub messages: Vec<SourceMessage>,
    /// Quota reported alongside the page, if the source exposes it.
    pub limits: Option<LimitInfo>,
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Returns up to `limit` messages strictly after `cursor`, oldest first.
    /// An empty page means the end of history.
    async fn history_page(
        &self,
        location: &Location,
        cursor: HistoryCursor,
        limit: usize,
    ) -> Result<HistoryPage, SourceError>;
}

/// Smallest snowflake that could have been minted at `at`; used to turn a
/// timestamp into an `after` cursor.
pub fn snowflake_at(at: DateTime<Utc>) -> u64 {
    let ms = (at.timestamp_millis() - DISCORD_EPOCH_MS).max(0) as u64;
    ms << 22
}

/// Creation instant encoded in a snowflake, millisecond precision.
pub fn snowflake_time(id: u64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis((id >> 22) as i64 + DISCORD_EPOCH_MS)
}

pub fn message_from_discord(message: &Message, location: Location) -> SourceMessage {
    SourceMessage {
        id: message.id.get(),
        location,
        author_id: message.author.id.get(),
        content: message.content.clone(),
        created_at: snowflake_time(message.id.get())
            .or_else(|| DateTime::<Utc>::from_timestamp(message.timestamp.unix_timestamp(), 0))
            .unwrap_or_else(Utc::now),
        attachments: message
            .attachments
            .iter()
            .map(|a| SourceAttachment {
                filename: a.filename.clone(),
                size: a.size as u64,
                url: a.url.clone(),
            })
            .collect(),
    }
}

/// History reader backed by the Discord REST API.
pub struct DiscordSource {
    http: Arc<Http>,
}

impl DiscordSource {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ContentSource for DiscordSource {
    async fn history_page(
        &self,
        location: &Location,
        cursor: HistoryCursor,
        limit: usize,
    ) -> Result<HistoryPage, SourceError> {
        let after = match cursor {
            HistoryCursor::Start => 0,
            HistoryCursor::After(at) => snowflake_at(at),
            HistoryCursor::AfterMessage(id) => id,
        };
        // Snowflake 0 is rejected by the API; 1 means "from the beginning".
        let builder = GetMessages::new()
            .after(MessageId::new(after.max(1)))
            .limit(limit.clamp(1, 100) as u8);

        let mut messages = ChannelId::new(location.target_channel())
            .messages(&self.http, builder)
            .await
            .map_err(|e| classify_serenity_error(e, location))?;

        messages.sort_by_key(|m| m.id);
        let messages = messages
            .iter()
            .map(|m| message_from_discord(m, *location))
            .collect();

        Ok(HistoryPage {
            messages,
            limits: None,
        })
    }
}

fn classify_serenity_error(error: serenity::Error, location: &Location) -> SourceError {
    use serenity::http::HttpError;

    match error {
        serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) => {
            match response.status_code.as_u16() {
                403 | 404 => SourceError::NotFound(format!(
                    "{} ({})",
                    location, response.error.message
                )),
                429 => SourceError::RateLimited {
                    retry_after: Duration::from_secs(1),
                    global: false,
                },
                status if status >= 500 => {
                    SourceError::Transient(format!("HTTP {} reading {}", status, location))
                }
                status => SourceError::Other(format!(
                    "HTTP {} reading {}: {}",
                    status, location, response.error.message
                )),
            }
        }
        serenity::Error::Http(HttpError::Request(e)) => SourceError::Transient(e.to_string()),
        serenity::Error::Io(e) => SourceError::Transient(e.to_string()),
        other => SourceError::Other(other.to_string()),
    }
}
