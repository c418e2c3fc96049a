use crate::bot::resolve_location;
use crate::db::BackupConfig;
use crate::error::ExportError;
use crate::model::Location;
use crate::queue::Notification;
use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use tracing::info;

const MAX_LISTED_CONFIGS: usize = 15;

/// Manage backups of your posts
#[poise::command(
    slash_command,
    subcommands("enable", "disable", "status", "export", "delete"),
    guild_only
)]
pub async fn backup(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

async fn current_location(ctx: Context<'_>) -> Result<Location, Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    Ok(resolve_location(ctx.serenity_context(), guild_id, ctx.channel_id()).await?)
}

/// Loads a config by id, or the caller's config for this channel. Only the
/// owning author may act on it.
async fn owned_config(ctx: Context<'_>, id: Option<i64>) -> Result<Option<BackupConfig>, Error> {
    let author_id = ctx.author().id.get();
    let db = ctx.data().db.clone();
    let config = match id {
        Some(id) => db.run_blocking(move |db| db.get_config(id)).await?,
        None => {
            let location = current_location(ctx).await?;
            db.run_blocking(move |db| db.get_backup_config(&location, author_id))
                .await?
        }
    };
    Ok(config.filter(|c| c.author_id == author_id))
}

/// Start backing up your messages in this channel or thread
#[poise::command(slash_command, guild_only)]
pub async fn enable(
    ctx: Context<'_>,
    #[description = "Title for this backup"] title: Option<String>,
) -> Result<(), Error> {
    let location = current_location(ctx).await?;
    let author_id = ctx.author().id.get();
    ctx.data()
        .notifications
        .send(Notification::Enable {
            location,
            author_id,
            title,
        })
        .await?;
    info!("Command: backup enable for {} by {}", location, author_id);
    ctx.say("✅ Backup enabled. Your earlier messages here are being scanned now.")
        .await?;
    Ok(())
}

/// Stop backing up your messages in this channel or thread
#[poise::command(slash_command, guild_only)]
pub async fn disable(ctx: Context<'_>) -> Result<(), Error> {
    let location = current_location(ctx).await?;
    let author_id = ctx.author().id.get();
    ctx.data()
        .notifications
        .send(Notification::Disable {
            location,
            author_id,
        })
        .await?;
    ctx.say("⏸️ Backup disabled. Already archived content is kept; use `/backup delete` to remove it.")
        .await?;
    Ok(())
}

/// Show your backups
#[poise::command(slash_command, guild_only)]
pub async fn status(ctx: Context<'_>) -> Result<(), Error> {
    let author_id = ctx.author().id.get();
    let data = ctx.data();
    let configs = data
        .db
        .run_blocking(move |db| db.list_configs_by_author(author_id))
        .await?;

    if configs.is_empty() {
        ctx.say("You have no active backups. Use `/backup enable` in a channel or thread.")
            .await?;
        return Ok(());
    }

    let mut embed = serenity::CreateEmbed::new()
        .title("🗄️ Your backups")
        .color(0x5865F2);
    for config in configs.iter().take(MAX_LISTED_CONFIGS) {
        let id = config.id;
        let stats = data.db.run_blocking(move |db| db.backup_stats(Some(id))).await?;
        let checkpoint = config
            .last_check_time
            .map(|t| format!("<t:{}:R>", t.timestamp()))
            .unwrap_or_else(|| "never".to_string());
        embed = embed.field(
            format!(
                "#{} {}",
                config.id,
                config.title.as_deref().unwrap_or("(untitled)")
            ),
            format!(
                "<#{}> · {} messages · {} files ({} bytes)\nLast sync: {} · {:?}",
                config.location.target_channel(),
                stats.message_count,
                stats.file_count,
                stats.total_size,
                checkpoint,
                data.sync.state(config.id)
            ),
            false,
        );
    }
    if configs.len() > MAX_LISTED_CONFIGS {
        embed = embed.footer(serenity::CreateEmbedFooter::new(format!(
            "…and {} more",
            configs.len() - MAX_LISTED_CONFIGS
        )));
    }

    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}

/// Download an archive of a backup
#[poise::command(slash_command, guild_only)]
pub async fn export(
    ctx: Context<'_>,
    #[description = "Backup id (defaults to this channel)"] id: Option<i64>,
) -> Result<(), Error> {
    ctx.defer_ephemeral().await?;
    let Some(config) = owned_config(ctx, id).await? else {
        ctx.say("❌ No backup of yours was found.").await?;
        return Ok(());
    };

    let bundle = match ctx.data().packager.export(config.id).await {
        Ok(bundle) => bundle,
        Err(e @ ExportError::AttachmentTooLarge { .. }) | Err(e @ ExportError::ManifestTooLarge { .. }) => {
            ctx.say(format!("❌ Cannot export: {}", e)).await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let count = bundle.volumes.len();
    ctx.say(format!(
        "📦 Backup #{}: {} messages, {} attachments, {} volume(s), {} bytes{}",
        config.id,
        bundle.message_count,
        bundle.attachment_count,
        count,
        bundle.total_bytes,
        if bundle.skipped.is_empty() {
            String::new()
        } else {
            format!(" ({} attachments could not be fetched)", bundle.skipped.len())
        }
    ))
    .await?;

    for volume in &bundle.volumes {
        let attachment = serenity::CreateAttachment::path(&volume.path).await?;
        ctx.send(
            poise::CreateReply::default()
                .content(format!("Volume {}/{}", volume.index, count))
                .attachment(attachment)
                .ephemeral(true),
        )
        .await?;
    }
    Ok(())
}

/// Delete a backup and everything archived under it
#[poise::command(slash_command, guild_only)]
pub async fn delete(
    ctx: Context<'_>,
    #[description = "Backup id (defaults to this channel)"] id: Option<i64>,
) -> Result<(), Error> {
    let Some(config) = owned_config(ctx, id).await? else {
        ctx.say("❌ No backup of yours was found.").await?;
        return Ok(());
    };
    let config_id = config.id;
    let deleted = ctx
        .data()
        .db
        .run_blocking(move |db| db.delete_backup_config(config_id))
        .await?;
    if deleted {
        info!("Command: backup {} deleted by {}", config_id, ctx.author().id);
        ctx.say(format!("🗑️ Backup #{} deleted.", config_id)).await?;
    } else {
        ctx.say("❌ Backup was already deleted.").await?;
    }
    Ok(())
}
