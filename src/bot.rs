//! Gateway event handling and Discord-specific glue.

use crate::db::BackupConfig;
use crate::model::Location;
use crate::reconnect::{Disconnect, DisconnectKind};
use crate::source::message_from_discord;
use crate::{Data, Error};
use chrono::Utc;
use ::serenity::gateway::GatewayError;
use ::serenity::http::HttpError;
use poise::serenity_prelude as serenity;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

/// Maps a Discord channel to a location, walking up to the parent channel
/// when `channel_id` is a thread.
pub async fn resolve_location(
    ctx: &serenity::Context,
    guild_id: serenity::GuildId,
    channel_id: serenity::ChannelId,
) -> anyhow::Result<Location> {
    let channel = channel_id.to_channel(ctx).await?;
    let location = match channel.guild() {
        Some(gc) if gc.thread_metadata.is_some() => match gc.parent_id {
            Some(parent) => Location::thread(guild_id.get(), parent.get(), channel_id.get()),
            None => Location::channel(guild_id.get(), channel_id.get()),
        },
        _ => Location::channel(guild_id.get(), channel_id.get()),
    };
    Ok(location)
}

async fn enabled_config(
    data: &Data,
    location: Location,
    author_id: u64,
) -> anyhow::Result<Option<BackupConfig>> {
    let config = data
        .db
        .run_blocking(move |db| db.get_backup_config(&location, author_id))
        .await?;
    Ok(config.filter(|c| c.enabled))
}

pub async fn handle_event(
    ctx: &serenity::Context,
    event: &serenity::FullEvent,
    data: &Data,
) -> Result<(), Error> {
    match event {
        serenity::FullEvent::Ready { data_about_bot } => {
            info!("Bot: connected as {}", data_about_bot.user.name);
            data.supervisor.mark_connected();
            if !data.recovery_started.swap(true, Ordering::SeqCst) {
                let recovery = data.recovery.clone();
                let last_activity = data.startup_activity;
                tokio::spawn(async move {
                    if let Err(e) = recovery.recover(last_activity, Utc::now()).await {
                        error!("Recovery: aborted: {}", e);
                    }
                });
            }
        }
        serenity::FullEvent::Resume { .. } => {
            data.supervisor.mark_connected();
        }
        serenity::FullEvent::Message { new_message } => {
            if new_message.author.bot {
                return Ok(());
            }
            let Some(guild_id) = new_message.guild_id else {
                return Ok(());
            };
            let location = resolve_location(ctx, guild_id, new_message.channel_id).await?;
            let Some(config) = enabled_config(data, location, new_message.author.id.get()).await?
            else {
                return Ok(());
            };
            let message = message_from_discord(new_message, location);
            data.archiver.persist(&config, &message).await?;
        }
        serenity::FullEvent::MessageUpdate { new, event, .. } => {
            let Some(guild_id) = event.guild_id else {
                return Ok(());
            };
            let message = match new {
                Some(message) => message.clone(),
                None => match event.channel_id.message(&ctx.http, event.id).await {
                    Ok(message) => message,
                    Err(e) => {
                        debug!("Bot: cannot load edited message {}: {}", event.id, e);
                        return Ok(());
                    }
                },
            };
            if message.author.bot {
                return Ok(());
            }
            let location = resolve_location(ctx, guild_id, message.channel_id).await?;
            let Some(config) = enabled_config(data, location, message.author.id.get()).await?
            else {
                return Ok(());
            };
            data.archiver
                .persist_edit(&config, &message_from_discord(&message, location))
                .await?;
        }
        _ => {}
    }
    Ok(())
}

/// Classifies an error that ended a client run.
pub fn classify_disconnect(error: &::serenity::Error) -> Disconnect {
    let kind = match error {
        ::serenity::Error::Gateway(GatewayError::Closed(_)) => {
            DisconnectKind::TransportClosed
        }
        ::serenity::Error::Tungstenite(_) => DisconnectKind::TransportClosed,
        ::serenity::Error::Http(HttpError::Request(e)) => {
            if e.is_timeout() {
                DisconnectKind::Timeout
            } else if e.is_connect() {
                DisconnectKind::EndpointUnreachable
            } else {
                DisconnectKind::Other
            }
        }
        ::serenity::Error::Io(e) => match e.kind() {
            std::io::ErrorKind::TimedOut => DisconnectKind::Timeout,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::AddrNotAvailable => DisconnectKind::EndpointUnreachable,
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                DisconnectKind::TransportClosed
            }
            _ => DisconnectKind::Other,
        },
        other => classify_message(&other.to_string()),
    };
    if kind == DisconnectKind::Other {
        warn!("Bot: unclassified connection error: {:?}", error);
    }
    Disconnect::new(kind, error.to_string())
}

fn classify_message(message: &str) -> DisconnectKind {
    let lower = message.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        DisconnectKind::Timeout
    } else if lower.contains("cannot connect") || lower.contains("dns") {
        DisconnectKind::EndpointUnreachable
    } else if lower.contains("closed") {
        DisconnectKind::TransportClosed
    } else {
        DisconnectKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_io_errors() {
        let timeout = ::serenity::Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "semaphore timeout",
        ));
        assert_eq!(classify_disconnect(&timeout).kind, DisconnectKind::Timeout);

        let refused = ::serenity::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert_eq!(
            classify_disconnect(&refused).kind,
            DisconnectKind::EndpointUnreachable
        );
    }

    #[test]
    fn test_classify_gateway_close() {
        let closed = ::serenity::Error::Gateway(GatewayError::Closed(None));
        let disconnect = classify_disconnect(&closed);
        assert_eq!(disconnect.kind, DisconnectKind::TransportClosed);
        assert!(!disconnect.message.is_empty());
    }

    #[test]
    fn test_classify_message_fallback() {
        assert_eq!(classify_message("Operation Timed Out"), DisconnectKind::Timeout);
        assert_eq!(
            classify_message("Cannot connect to host discord.com"),
            DisconnectKind::EndpointUnreachable
        );
        assert_eq!(classify_message("something odd"), DisconnectKind::Other);
    }
}
