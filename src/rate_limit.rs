//! Destination-wide "pause until" windows fed by rate-limit responses.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::util::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    default_backoff: Duration,
    max_backoff: Duration,
}

impl RateLimitPolicy {
    pub const fn standard() -> Self {
        Self {
            default_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }

    /// Pause applied when a rate-limit response carries no retry hint.
    pub const fn default_backoff(mut self, default_backoff: Duration) -> Self {
        self.default_backoff = default_backoff;
        self
    }

    /// Upper bound on any pause, hinted or not.
    pub const fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn pause_for(&self, hint: Option<Duration>) -> Duration {
        hint.unwrap_or(self.default_backoff).min(self.max_backoff)
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Monotonic "pause until" timestamp shared by every caller of one destination.
#[derive(Debug, Default)]
pub struct BackoffWindow {
    until: Mutex<Option<Instant>>,
}

impl BackoffWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_backoff(&self) -> bool {
        !self.remaining().is_zero()
    }

    pub fn remaining(&self) -> Duration {
        let until = lock_unpoisoned(&self.until);
        match *until {
            Some(until) => until.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Pauses the destination for `delay` from now. An already longer pause
    /// is kept.
    pub fn set_backoff(&self, delay: Duration) {
        let candidate = Instant::now() + delay;
        let mut until = lock_unpoisoned(&self.until);
        *until = Some(match *until {
            Some(existing) => existing.max(candidate),
            None => candidate,
        });
    }

    pub fn clear(&self) {
        *lock_unpoisoned(&self.until) = None;
    }

    /// Sleeps until the window closes; returns at once when it is not active.
    pub async fn wait_for_backoff(&self) {
        loop {
            let remaining = self.remaining();
            if remaining.is_zero() {
                return;
            }
            tokio::time::sleep(remaining).await;
        }
    }
}

/// Admission gate consulted before every transport attempt.
pub trait RateLimiter: Send + Sync {
    fn wait<'a>(&'a self, destination: &'a str) -> BoxFuture<'a, ()>;

    fn observe_throttle(&self, destination: &str, delay: Duration);
}

/// Backoff windows keyed by destination, created on first use.
#[derive(Debug, Default)]
pub struct BackoffRegistry {
    windows: Mutex<BTreeMap<String, Arc<BackoffWindow>>>,
}

impl BackoffRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window(&self, destination: &str) -> Arc<BackoffWindow> {
        let mut windows = lock_unpoisoned(&self.windows);
        Arc::clone(windows.entry(destination.to_owned()).or_default())
    }
}

impl RateLimiter for BackoffRegistry {
    fn wait<'a>(&'a self, destination: &'a str) -> BoxFuture<'a, ()> {
        let window = self.window(destination);
        Box::pin(async move {
            let remaining = window.remaining();
            if !remaining.is_zero() {
                debug!(
                    destination,
                    wait_ms = remaining.as_millis() as u64,
                    "waiting for rate-limit backoff window"
                );
            }
            window.wait_for_backoff().await;
        })
    }

    fn observe_throttle(&self, destination: &str, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        self.window(destination).set_backoff(delay);
    }
}

/// Limiter that never waits.
#[derive(Debug, Default)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn wait<'a>(&'a self, _destination: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    fn observe_throttle(&self, _destination: &str, _delay: Duration) {}
}

/// Registry key for a base URL and credential. The credential only enters
/// the key as a truncated SHA-256 fingerprint.
pub fn destination_key(base_url: &str, credential: Option<&str>) -> String {
    let base = base_url.trim_end_matches('/').to_ascii_lowercase();
    let Some(credential) = credential else {
        return base;
    };
    let digest = Sha256::digest(credential.as_bytes());
    let mut key = base;
    key.push('#');
    for byte in &digest[..8] {
        let _ = write!(key, "{byte:02x}");
    }
    key
}
