//! Keeps the gateway connection alive with capped exponential backoff.

use crate::error::ReconnectError;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const MAX_DELAY: Duration = Duration::from_secs(300);
/// Attempt at which the connectivity probe runs.
const DIAGNOSTIC_ATTEMPT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Backoff,
    Connecting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// The gateway closed the socket.
    TransportClosed,
    /// DNS or TCP connect failed.
    EndpointUnreachable,
    /// OS-level timeout.
    Timeout,
    Other,
}

impl DisconnectKind {
    pub fn remediation_hint(&self) -> &'static str {
        match self {
            Self::TransportClosed => {
                "gateway closed the connection; usually transient. If it repeats, check the token and gateway intents"
            }
            Self::EndpointUnreachable => {
                "cannot reach Discord; check network connectivity, DNS and any proxy/VPN, and that the system clock is correct"
            }
            Self::Timeout => {
                "network timed out; check firewall rules, try without VPN/proxy, or switch DNS (8.8.8.8 / 1.1.1.1)"
            }
            Self::Other => "unexpected connection error; check network connectivity and retry later",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Disconnect {
    pub kind: DisconnectKind,
    pub message: String,
}

impl Disconnect {
    pub fn new(kind: DisconnectKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One-shot reachability checks used for operator diagnostics.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn internet_reachable(&self) -> bool;
    async fn platform_reachable(&self) -> bool;
}

pub struct HttpProbe {
    client: reqwest::Client,
    internet_urls: Vec<String>,
    platform_url: String,
}

impl HttpProbe {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            internet_urls: vec![
                "https://www.google.com".to_string(),
                "https://1.1.1.1".to_string(),
                "https://www.cloudflare.com".to_string(),
            ],
            platform_url: "https://discord.com/api/v10/gateway".to_string(),
        })
    }

    async fn reachable(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => response.status().as_u16() < 400,
            Err(e) => {
                debug!("Diagnostics: {} unreachable: {}", url, e);
                false
            }
        }
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn internet_reachable(&self) -> bool {
        for url in &self.internet_urls {
            if self.reachable(url).await {
                return true;
            }
        }
        false
    }

    async fn platform_reachable(&self) -> bool {
        self.reachable(&self.platform_url).await
    }
}

/// Generic connectivity first, then the platform endpoint.
pub async fn diagnose(probe: &dyn ConnectivityProbe) -> bool {
    info!("Diagnostics: checking network connectivity...");
    if !probe.internet_reachable().await {
        error!("Diagnostics: no general internet connectivity");
        return false;
    }
    if !probe.platform_reachable().await {
        error!("Diagnostics: internet is up but the Discord API is unreachable (proxy or outage?)");
        return false;
    }
    info!("Diagnostics: network looks healthy");
    true
}

#[derive(Clone)]
pub struct ReconnectSupervisor {
    base_delay: Duration,
    max_retries: u32,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    retries: Arc<AtomicU32>,
    state: Arc<Mutex<ConnectionState>>,
}

impl ReconnectSupervisor {
    /// `probe` of `None` disables diagnostics.
    pub fn new(
        base_delay: Duration,
        max_retries: u32,
        probe: Option<Arc<dyn ConnectivityProbe>>,
    ) -> Self {
        Self {
            base_delay,
            max_retries,
            probe,
            retries: Arc::new(AtomicU32::new(0)),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
        }
    }

    /// `min(base * 2^(attempt-1), 300s)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(MAX_DELAY)
            .min(MAX_DELAY)
    }

    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    /// Called when the transport reports a live session.
    pub fn mark_connected(&self) {
        let previous = self.retries.swap(0, Ordering::SeqCst);
        if previous > 0 {
            info!("Reconnect: connected, resetting retry count (was {})", previous);
        }
        self.set_state(ConnectionState::Connected);
    }

    /// Records a connection loss and returns how long to back off.
    pub fn on_disconnect(&self, disconnect: &Disconnect) -> Result<Duration, ReconnectError> {
        self.set_state(ConnectionState::Disconnected);
        let attempt = self.retries.fetch_add(1, Ordering::SeqCst) + 1;

        if attempt > self.max_retries {
            self.set_state(ConnectionState::Failed);
            error!(
                "Reconnect: giving up after {} retries ({:?}: {})",
                self.max_retries, disconnect.kind, disconnect.message
            );
            error!("Reconnect: hint: {}", disconnect.kind.remediation_hint());
            return Err(ReconnectError::Exhausted {
                attempts: self.max_retries,
                last_error: disconnect.message.clone(),
            });
        }

        let delay = self.delay_for(attempt);
        warn!(
            "Reconnect: attempt {}/{} after {:?}: {}",
            attempt, self.max_retries, disconnect.kind, disconnect.message
        );
        info!("Reconnect: hint: {}", disconnect.kind.remediation_hint());

        if attempt == DIAGNOSTIC_ATTEMPT {
            if let Some(probe) = &self.probe {
                let probe = probe.clone();
                tokio::spawn(async move {
                    if !diagnose(probe.as_ref()).await {
                        warn!("Reconnect: diagnostics failed, retrying anyway");
                    }
                });
            }
        }

        info!("Reconnect: waiting {:?} before reconnecting", delay);
        self.set_state(ConnectionState::Backoff);
        Ok(delay)
    }

    /// Runs `connect` until it returns cleanly, backing off between
    /// failures. Exhausting the retry budget is returned to the caller.
    pub async fn run<F, Fut>(&self, mut connect: F) -> Result<(), ReconnectError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), Disconnect>>,
    {
        loop {
            self.set_state(ConnectionState::Connecting);
            match connect().await {
                Ok(()) => return Ok(()),
                Err(disconnect) => {
                    let delay = self.on_disconnect(&disconnect)?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
