use crate::db::Database;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Process-wide shutdown switch. Only the first `trigger` does anything.
#[derive(Clone)]
pub struct Shutdown {
    token: CancellationToken,
    triggered: Arc<AtomicBool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Returns `true` for the caller that actually started the shutdown.
    pub fn trigger(&self, reason: &str) -> bool {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("Shutdown: already in progress, ignoring '{}'", reason);
            return false;
        }
        info!("Shutdown: starting ({})", reason);
        self.token.cancel();
        true
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// Persists the activity timestamp used for downtime detection.
    pub async fn finish(&self, db: &Database) {
        match db.run_blocking(|db| db.record_activity(Utc::now())).await {
            Ok(()) => info!("Shutdown: recorded last activity time"),
            Err(e) => error!("Shutdown: failed to record last activity time: {}", e),
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = term.recv() => "SIGTERM",
                }
            }
            Err(e) => {
                error!("Shutdown: cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}
