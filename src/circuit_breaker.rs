//! Per-operation circuit breaker.
//!
//! The stored state is only `Closed` or `Open`. Half-open is read off the
//! clock: an open breaker whose cool-down has elapsed lets probes through, and
//! the next recorded outcome decides whether it closes or re-opens.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::Error;
use crate::util::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitBreakerPolicy {
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_max_calls: u32,
}

impl CircuitBreakerPolicy {
    pub const fn standard() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }

    pub const fn failure_threshold(mut self, failure_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold;
        self
    }

    pub const fn reset_timeout(mut self, reset_timeout: Duration) -> Self {
        self.reset_timeout = reset_timeout;
        self
    }

    pub const fn half_open_max_calls(mut self, half_open_max_calls: u32) -> Self {
        self.half_open_max_calls = half_open_max_calls;
        self
    }

    pub const fn configured_failure_threshold(&self) -> u32 {
        if self.failure_threshold == 0 {
            1
        } else {
            self.failure_threshold
        }
    }

    pub const fn configured_reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    pub const fn configured_half_open_max_calls(&self) -> u32 {
        if self.half_open_max_calls == 0 {
            1
        } else {
            self.half_open_max_calls
        }
    }
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Plain breaker value; all transitions go through `&mut self`.
#[derive(Clone, Debug)]
pub struct CircuitBreaker {
    name: String,
    policy: CircuitBreakerPolicy,
    failure_count: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, policy: CircuitBreakerPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            failure_count: 0,
            opened_at: None,
            half_open_in_flight: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> CircuitBreakerPolicy {
        self.policy
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    pub fn state(&self) -> CircuitState {
        self.state_at(Instant::now())
    }

    pub fn state_at(&self, now: Instant) -> CircuitState {
        match self.opened_at {
            None => CircuitState::Closed,
            Some(opened_at)
                if now.saturating_duration_since(opened_at)
                    >= self.policy.configured_reset_timeout() =>
            {
                CircuitState::HalfOpen
            }
            Some(_) => CircuitState::Open,
        }
    }

    pub fn allow_request(&self) -> bool {
        self.allow_request_at(Instant::now())
    }

    pub fn allow_request_at(&self, now: Instant) -> bool {
        !matches!(self.state_at(now), CircuitState::Open)
    }

    /// Time left until an open breaker starts admitting probes.
    pub fn remaining_open_at(&self, now: Instant) -> Duration {
        match self.opened_at {
            Some(opened_at) => self
                .policy
                .configured_reset_timeout()
                .saturating_sub(now.saturating_duration_since(opened_at)),
            None => Duration::ZERO,
        }
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        match self.opened_at {
            None if self.failure_count >= self.policy.configured_failure_threshold() => {
                self.opened_at = Some(now);
            }
            // A failed probe restarts the cool-down.
            Some(_) if self.state_at(now) == CircuitState::HalfOpen => {
                self.opened_at = Some(now);
            }
            _ => {}
        }
    }

    pub fn reset(&mut self) {
        self.failure_count = 0;
        self.opened_at = None;
        self.half_open_in_flight = 0;
    }

    /// Admission check used by [`SharedCircuitBreaker::call`]; unlike
    /// [`allow_request`](Self::allow_request) it also caps concurrent
    /// half-open probes.
    fn try_begin_at(&mut self, now: Instant) -> Result<CircuitState, Duration> {
        match self.state_at(now) {
            CircuitState::Closed => Ok(CircuitState::Closed),
            CircuitState::Open => Err(self.remaining_open_at(now)),
            CircuitState::HalfOpen => {
                if self.half_open_in_flight >= self.policy.configured_half_open_max_calls() {
                    return Err(Duration::ZERO);
                }
                self.half_open_in_flight = self.half_open_in_flight.saturating_add(1);
                Ok(CircuitState::HalfOpen)
            }
        }
    }

    fn finish_probe(&mut self, admitted_as: CircuitState) {
        if admitted_as == CircuitState::HalfOpen {
            self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
        }
    }
}

/// Breaker shared across concurrent calls; mutation is serialized by a mutex.
#[derive(Debug)]
pub struct SharedCircuitBreaker {
    inner: Mutex<CircuitBreaker>,
}

impl SharedCircuitBreaker {
    pub fn new(name: impl Into<String>, policy: CircuitBreakerPolicy) -> Self {
        Self {
            inner: Mutex::new(CircuitBreaker::new(name, policy)),
        }
    }

    /// Copy of the current breaker value.
    pub fn snapshot(&self) -> CircuitBreaker {
        lock_unpoisoned(&self.inner).clone()
    }

    pub fn state(&self) -> CircuitState {
        lock_unpoisoned(&self.inner).state()
    }

    pub fn allow_request(&self) -> bool {
        lock_unpoisoned(&self.inner).allow_request()
    }

    pub fn record_success(&self) {
        lock_unpoisoned(&self.inner).record_success();
    }

    pub fn record_failure(&self) {
        lock_unpoisoned(&self.inner).record_failure();
    }

    pub fn reset(&self) {
        lock_unpoisoned(&self.inner).reset();
    }

    /// Runs `operation` if the breaker admits it; any `Ok` counts as success.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.call_with(operation, |result| result.is_ok()).await
    }

    /// Runs `operation` if the breaker admits it and records the outcome as
    /// judged by `is_success`. A rejected call never invokes `operation`.
    pub async fn call_with<T, F, Fut, C>(&self, operation: F, is_success: C) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
        C: FnOnce(&Result<T, Error>) -> bool,
    {
        let attempt = self.begin()?;
        let result = operation().await;
        attempt.finish(is_success(&result));
        result
    }

    fn begin(&self) -> Result<BreakerAttempt<'_>, Error> {
        let mut breaker = lock_unpoisoned(&self.inner);
        match breaker.try_begin_at(Instant::now()) {
            Ok(admitted_as) => {
                if admitted_as == CircuitState::HalfOpen {
                    debug!(breaker = %breaker.name, "admitting half-open probe");
                }
                Ok(BreakerAttempt {
                    breaker: self,
                    admitted_as,
                    finished: false,
                })
            }
            Err(remaining) => Err(Error::CircuitOpen {
                name: breaker.name.clone(),
                retry_after_ms: remaining.as_millis(),
            }),
        }
    }
}

/// Admission ticket; dropping it unfinished (a cancelled call) frees the
/// probe slot without recording an outcome.
struct BreakerAttempt<'a> {
    breaker: &'a SharedCircuitBreaker,
    admitted_as: CircuitState,
    finished: bool,
}

impl BreakerAttempt<'_> {
    fn finish(mut self, success: bool) {
        let mut breaker = lock_unpoisoned(&self.breaker.inner);
        breaker.finish_probe(self.admitted_as);
        if success {
            breaker.record_success();
        } else {
            let was_closed = breaker.opened_at.is_none();
            breaker.record_failure();
            if was_closed && breaker.opened_at.is_some() {
                warn!(
                    breaker = %breaker.name,
                    failures = breaker.failure_count,
                    "circuit breaker opened"
                );
            }
        }
        self.finished = true;
    }
}

impl Drop for BreakerAttempt<'_> {
    fn drop(&mut self) {
        if !self.finished {
            lock_unpoisoned(&self.breaker.inner).finish_probe(self.admitted_as);
        }
    }
}

/// Breakers keyed by operation name, created on first use.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Mutex<BTreeMap<String, Arc<SharedCircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &self,
        name: &str,
        policy: CircuitBreakerPolicy,
    ) -> Arc<SharedCircuitBreaker> {
        let mut breakers = lock_unpoisoned(&self.breakers);
        Arc::clone(
            breakers
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(SharedCircuitBreaker::new(name, policy))),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<SharedCircuitBreaker>> {
        lock_unpoisoned(&self.breakers).get(name).cloned()
    }

    pub fn reset_all(&self) {
        for breaker in lock_unpoisoned(&self.breakers).values() {
            breaker.reset();
        }
    }
}
