use archivist::archiver::{Archiver, AttachmentPolicy};
use archivist::bot::{classify_disconnect, handle_event};
use archivist::commands::backup;
use archivist::config::Config;
use archivist::db::Database;
use archivist::fetch::{AttachmentFetcher, HttpFetcher};
use archivist::packager::ArchivePackager;
use archivist::queue::{NotificationProcessor, NotificationQueue};
use archivist::rate_limit::RateLimiter;
use archivist::reconnect::{ConnectivityProbe, HttpProbe, ReconnectSupervisor};
use archivist::recovery::RecoveryCoordinator;
use archivist::shutdown::{wait_for_signal, Shutdown};
use archivist::source::{ContentSource, DiscordSource};
use archivist::storage::build_sink;
use archivist::sync::HistorySynchronizer;
use archivist::tasks::ScanTaskWorker;
use archivist::Data;
use poise::serenity_prelude as serenity;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

fn build_framework(data: Data) -> poise::Framework<Data, archivist::Error> {
    poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![backup::backup()],
            event_handler: |ctx, event, _framework, data| Box::pin(handle_event(ctx, event, data)),
            ..Default::default()
        })
        .setup(move |ctx, _ready, framework| {
            Box::pin(async move {
                if data.config.register_commands {
                    match data.config.dev_guild_id {
                        Some(guild_id) => {
                            poise::builtins::register_in_guild(
                                ctx,
                                &framework.options().commands,
                                serenity::GuildId::new(guild_id),
                            )
                            .await?;
                            info!("Registered commands in guild {}", guild_id);
                        }
                        None => {
                            poise::builtins::register_globally(ctx, &framework.options().commands)
                                .await?;
                            info!("Registered commands globally");
                        }
                    }
                }
                Ok(data)
            })
        })
        .build()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration: {:?}", config);

    let db = Database::new(&config)?;
    db.execute_init()?;
    let startup_activity = db.last_activity()?;

    // Services
    let http = Arc::new(serenity::Http::new(&config.discord_token));
    let source: Arc<dyn ContentSource> = Arc::new(DiscordSource::new(http));
    let fetcher: Arc<dyn AttachmentFetcher> = Arc::new(HttpFetcher::new()?);
    let sink = build_sink(&config)?;
    if let Err(e) = sink.check().await {
        warn!("Attachment storage is not reachable yet: {}", e);
    }

    let archiver = Archiver::new(
        db.clone(),
        fetcher.clone(),
        sink,
        AttachmentPolicy::from_config(&config),
    );
    let sync = HistorySynchronizer::new(db.clone(), source, RateLimiter::new(), archiver.clone());
    let recovery = Arc::new(RecoveryCoordinator::new(
        db.clone(),
        sync.clone(),
        Duration::from_secs(config.recovery_threshold_secs),
    ));
    let packager = Arc::new(ArchivePackager::new(
        db.clone(),
        fetcher,
        config.export_volume_limit,
    ));
    let probe: Option<Arc<dyn ConnectivityProbe>> = if config.enable_diagnostics {
        Some(Arc::new(HttpProbe::new()?))
    } else {
        None
    };
    let supervisor = ReconnectSupervisor::new(
        Duration::from_secs(config.base_retry_delay_secs),
        config.max_retries,
        probe,
    );

    // Background workers
    let shutdown = Shutdown::new();
    let queue = NotificationQueue::new();
    let notifications = queue.sender();
    let workers = vec![
        tokio::spawn(
            NotificationProcessor::new(
                queue,
                db.clone(),
                sync.clone(),
                Duration::from_secs(config.notification_poll_secs),
            )
            .run(shutdown.token()),
        ),
        tokio::spawn(
            ScanTaskWorker::new(
                db.clone(),
                sync.clone(),
                Duration::from_secs(config.scan_task_interval_secs),
            )
            .run(shutdown.token()),
        ),
    ];

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let signal = wait_for_signal().await;
            shutdown.trigger(signal);
        });
    }

    let data = Data {
        config: config.clone(),
        db: db.clone(),
        archiver,
        sync,
        packager,
        notifications,
        supervisor: supervisor.clone(),
        recovery,
        startup_activity,
        recovery_started: Arc::new(AtomicBool::new(false)),
    };

    let intents = serenity::GatewayIntents::non_privileged()
        | serenity::GatewayIntents::MESSAGE_CONTENT
        | serenity::GatewayIntents::GUILD_MESSAGES;

    info!("Starting bot...");
    let result = supervisor
        .run(|| {
            let data = data.clone();
            let shutdown = shutdown.clone();
            let discord_token = config.discord_token.clone();
            async move {
                if shutdown.is_triggered() {
                    return Ok(());
                }
                let mut client = serenity::ClientBuilder::new(&discord_token, intents)
                    .framework(build_framework(data))
                    .await
                    .map_err(|e| classify_disconnect(&e))?;
                let shard_manager = client.shard_manager.clone();

                tokio::select! {
                    result = client.start() => result.map_err(|e| classify_disconnect(&e)),
                    _ = shutdown.wait() => {
                        shard_manager.shutdown_all().await;
                        Ok(())
                    }
                }
            }
        })
        .await;

    match &result {
        Ok(()) => {
            shutdown.trigger("client stopped");
        }
        Err(e) => {
            error!("Client error: {}", e);
            shutdown.trigger("reconnect attempts exhausted");
        }
    }

    for worker in workers {
        if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, worker).await.is_err() {
            warn!("Background worker did not stop in time");
        }
    }
    shutdown.finish(&db).await;
    info!("Shutdown complete");

    result.map_err(Into::into)
}
