//! Platform-neutral shapes of the content the archiver works on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a message lives: a channel, or a thread under a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub guild_id: u64,
    pub channel_id: u64,
    pub thread_id: Option<u64>,
}

impl Location {
    pub fn channel(guild_id: u64, channel_id: u64) -> Self {
        Self {
            guild_id,
            channel_id,
            thread_id: None,
        }
    }

    pub fn thread(guild_id: u64, channel_id: u64, thread_id: u64) -> Self {
        Self {
            guild_id,
            channel_id,
            thread_id: Some(thread_id),
        }
    }

    /// The channel whose history actually holds the messages.
    pub fn target_channel(&self) -> u64 {
        self.thread_id.unwrap_or(self.channel_id)
    }

    pub fn content_type(&self) -> ContentType {
        if self.thread_id.is_some() {
            ContentType::Thread
        } else {
            ContentType::Channel
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.thread_id {
            Some(thread) => write!(f, "{}/{}/{}", self.guild_id, self.channel_id, thread),
            None => write!(f, "{}/{}", self.guild_id, self.channel_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Channel,
    Thread,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::Thread => "thread",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "thread" => Self::Thread,
            _ => Self::Channel,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceAttachment {
    pub filename: String,
    /// Size declared by the platform; the fetched body is checked again.
    pub size: u64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceMessage {
    pub id: u64,
    pub location: Location,
    pub author_id: u64,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub attachments: Vec<SourceAttachment>,
}
