pub mod archiver;
pub mod bot;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod model;
pub mod packager;
pub mod queue;
pub mod rate_limit;
pub mod reconnect;
pub mod recovery;
pub mod shutdown;
pub mod source;
pub mod storage;
pub mod sync;
pub mod tasks;

#[cfg(test)]
mod testing;

use chrono::{DateTime, Utc};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Custom data passed to all commands and event handlers
#[derive(Clone)]
pub struct Data {
    pub config: config::Config,
    pub db: db::Database,
    pub archiver: archiver::Archiver,
    pub sync: sync::HistorySynchronizer,
    pub packager: Arc<packager::ArchivePackager>,
    pub notifications: queue::NotificationSender,
    pub supervisor: reconnect::ReconnectSupervisor,
    pub recovery: Arc<recovery::RecoveryCoordinator>,
    /// Last activity recorded before this process started.
    pub startup_activity: Option<DateTime<Utc>>,
    /// Recovery runs once per process, not once per gateway session.
    pub recovery_started: Arc<AtomicBool>,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
