//! Client-side throttling for calls to the content source.
//!
//! The limiter is the one piece of state shared by every concurrently
//! running scan. It tracks provider-reported quotas per route plus a global
//! cool-down, and parks callers until capacity is available.

use crate::error::SourceError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

/// Quota information reported by the provider for one response.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LimitInfo {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
    /// Explicit retry-after from a 429. With `global` set it gates every route.
    pub retry_after: Option<Duration>,
    pub global: bool,
}

impl LimitInfo {
    pub fn bucket(limit: u32, remaining: u32, reset_after: Duration) -> Self {
        Self {
            limit: Some(limit),
            remaining: Some(remaining),
            reset_after: Some(reset_after),
            ..Default::default()
        }
    }

    pub fn retry_after(retry_after: Duration, global: bool) -> Self {
        Self {
            retry_after: Some(retry_after),
            global,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct RouteState {
    limit: Option<u32>,
    remaining: Option<u32>,
    reset_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct LimiterState {
    routes: HashMap<String, RouteState>,
    global_until: Option<Instant>,
}

#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<LimiterState>>,
    max_rate_limit_retries: u32,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_max_retries(5)
    }

    pub fn with_max_retries(max_rate_limit_retries: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(LimiterState::default())),
            max_rate_limit_retries,
        }
    }

    /// Route key for a channel's message history.
    pub fn history_route(channel_id: u64) -> String {
        format!("GET /channels/{}/messages", channel_id)
    }

    /// Suspends until `route` and any global cool-down have capacity, then
    /// reserves one request from the route's bucket.
    ///
    /// Callers blocked on the same bucket all wait for the same reset
    /// instant, so they are released together.
    pub async fn await_capacity(&self, route: &str) {
        loop {
            let deadline = self.try_reserve(route);
            match deadline {
                None => return,
                Some(deadline) => {
                    debug!(
                        "RateLimiter: route {} waiting {:?}",
                        route,
                        deadline.saturating_duration_since(Instant::now())
                    );
                    sleep_until(deadline).await;
                }
            }
        }
    }

    fn try_reserve(&self, route: &str) -> Option<Instant> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();

        if let Some(until) = state.global_until {
            if until > now {
                return Some(until);
            }
            state.global_until = None;
        }

        let bucket = state.routes.entry(route.to_string()).or_default();
        if let Some(reset_at) = bucket.reset_at {
            if reset_at <= now {
                bucket.remaining = bucket.limit;
                bucket.reset_at = None;
            }
        }

        match (bucket.remaining, bucket.reset_at) {
            (Some(0), Some(reset_at)) => Some(reset_at),
            // Exhausted but no known reset: let the provider decide.
            (Some(0), None) => None,
            (Some(n), _) => {
                bucket.remaining = Some(n - 1);
                None
            }
            (None, _) => None,
        }
    }

    /// Ingests provider-reported limits for `route`.
    pub fn observe(&self, route: &str, info: &LimitInfo) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();

        if info.remaining.is_some() || info.limit.is_some() {
            let bucket = state.routes.entry(route.to_string()).or_default();
            if info.limit.is_some() {
                bucket.limit = info.limit;
            }
            bucket.remaining = info.remaining;
            bucket.reset_at = info.reset_after.map(|after| now + after);
            debug!(
                "RateLimiter: route {} now {:?}/{:?}, reset in {:?}",
                route, bucket.remaining, bucket.limit, info.reset_after
            );
        }

        if let Some(retry_after) = info.retry_after {
            let until = now + retry_after;
            if info.global {
                warn!("RateLimiter: global cool-down for {:?}", retry_after);
                state.global_until = Some(state.global_until.map_or(until, |g| g.max(until)));
            } else {
                let bucket = state.routes.entry(route.to_string()).or_default();
                bucket.remaining = Some(0);
                bucket.reset_at = Some(bucket.reset_at.map_or(until, |r| r.max(until)));
            }
        }
    }

    /// Runs `op` under the limiter. A rate-limited response is fed back into
    /// the limiter and the call is retried after sleeping the reported
    /// retry-after; every other outcome is returned as-is.
    pub async fn call<T, F, Fut>(&self, route: &str, mut op: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut attempts = 0u32;
        loop {
            self.await_capacity(route).await;
            match op().await {
                Err(SourceError::RateLimited {
                    retry_after,
                    global,
                }) if attempts < self.max_rate_limit_retries => {
                    attempts += 1;
                    self.observe(route, &LimitInfo::retry_after(retry_after, global));
                    warn!(
                        "RateLimiter: 429 on {} (attempt {}), retrying after {:?}",
                        route, attempts, retry_after
                    );
                    sleep(retry_after).await;
                }
                other => return other,
            }
        }
    }
}
