use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};

use crate::backoff::BackoffPolicy;
use crate::error::{Error, ErrorCategory};

/// What the retry layer knows about one failed attempt.
#[derive(Clone, Debug)]
pub struct RetryDecision {
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    pub max_attempts: u32,
    pub endpoint: String,
    pub method: Method,
    pub status: Option<StatusCode>,
    pub category: ErrorCategory,
    pub retry_after: Option<Duration>,
}

impl RetryDecision {
    pub fn for_error(
        attempt: u32,
        max_attempts: u32,
        endpoint: &str,
        method: &Method,
        error: &Error,
    ) -> Self {
        Self {
            attempt,
            max_attempts,
            endpoint: endpoint.to_owned(),
            method: method.clone(),
            status: error.status(),
            category: error.category(),
            retry_after: error.retry_after(),
        }
    }
}

pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, decision: &RetryDecision) -> bool;
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: BackoffPolicy,
    retryable_status_codes: BTreeSet<u16>,
    retry_on_connection_errors: bool,
    retry_on_timeouts: bool,
    retry_on_circuit_open: bool,
    respect_retry_after: bool,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field("retry_on_connection_errors", &self.retry_on_connection_errors)
            .field("retry_on_timeouts", &self.retry_on_timeouts)
            .field("retry_on_circuit_open", &self.retry_on_circuit_open)
            .field("respect_retry_after", &self.respect_retry_after)
            .field("has_retry_classifier", &self.retry_classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::standard()
        }
    }

    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::standard(),
            retryable_status_codes: default_retryable_status_codes(),
            retry_on_connection_errors: true,
            retry_on_timeouts: true,
            retry_on_circuit_open: true,
            respect_retry_after: true,
            retry_classifier: None,
        }
    }

    /// Total attempts including the first; floored at 1.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn base_backoff(mut self, base_backoff: Duration) -> Self {
        self.backoff = self.backoff.base(base_backoff);
        if self.backoff.configured_max() < base_backoff {
            self.backoff = self.backoff.max(base_backoff);
        }
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.backoff = self
            .backoff
            .max(max_backoff.max(self.backoff.configured_base()));
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.backoff = self.backoff.jitter_ratio(jitter_ratio);
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retry_on_connection_errors(mut self, retry: bool) -> Self {
        self.retry_on_connection_errors = retry;
        self
    }

    pub fn retry_on_timeouts(mut self, retry: bool) -> Self {
        self.retry_on_timeouts = retry;
        self
    }

    /// Whether a local circuit-open rejection consumes an attempt and waits
    /// for the next one instead of surfacing at once.
    pub fn retry_on_circuit_open(mut self, retry: bool) -> Self {
        self.retry_on_circuit_open = retry;
        self
    }

    /// Prefer a server `Retry-After`/`retry-after-ms` hint over the computed
    /// backoff.
    pub fn respect_retry_after(mut self, respect: bool) -> Self {
        self.respect_retry_after = respect;
        self
    }

    pub fn retry_classifier(mut self, retry_classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_classifier = Some(retry_classifier);
        self
    }

    pub fn configured_max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn configured_backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_status_codes.contains(&status.as_u16())
    }

    pub fn should_retry(&self, decision: &RetryDecision) -> bool {
        if decision.attempt >= decision.max_attempts.min(self.max_attempts) {
            return false;
        }
        if let Some(retry_classifier) = &self.retry_classifier {
            return retry_classifier.should_retry(decision);
        }
        if let Some(status) = decision.status {
            return self.is_retryable_status(status);
        }
        match decision.category {
            ErrorCategory::Connection => self.retry_on_connection_errors,
            ErrorCategory::RequestTimeout => self.retry_on_timeouts,
            ErrorCategory::CircuitOpen => self.retry_on_circuit_open,
            _ => false,
        }
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if self.respect_retry_after
            && let Some(retry_after) = retry_after
        {
            return retry_after;
        }
        self.backoff.delay(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [408_u16, 429].into_iter().chain(500..=599).collect()
}
