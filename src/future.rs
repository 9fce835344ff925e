//! Client-side handles for long-running server jobs.
//!
//! An async endpoint acknowledges with a request id; [`RemoteFuture`] polls the
//! endpoint's poll endpoint until the job completes, fails or the caller's
//! deadline passes. Nothing runs in the background: polling only happens while
//! [`RemoteFuture::wait`] is being awaited, so dropping a future abandons it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_core::Stream;
use futures_util::StreamExt;
use futures_util::future::join_all;
use futures_util::stream::FuturesUnordered;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::backoff::BackoffPolicy;
use crate::client::Client;
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorCategory};
use crate::telemetry::{Measurements, Metadata, events};

const PENDING_STATUSES: [&str; 4] = ["pending", "queued", "running", "try_again"];
const FAILED_STATUSES: [&str; 2] = ["failed", "error"];
const COMPLETED_STATUSES: [&str; 4] = ["completed", "complete", "succeeded", "success"];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AwaitOptions {
    deadline: Option<Duration>,
    backoff: BackoffPolicy,
}

impl AwaitOptions {
    /// No deadline; poll every 500ms doubling up to 30s, without jitter.
    pub const fn standard() -> Self {
        Self {
            deadline: None,
            backoff: BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(30)),
        }
    }

    /// Overall time budget for one `wait`, checked before every poll.
    pub const fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub const fn no_deadline(mut self) -> Self {
        self.deadline = None;
        self
    }

    pub const fn poll_interval(mut self, base: Duration) -> Self {
        self.backoff = self.backoff.base(base);
        self
    }

    /// Upper bound on any single wait between polls.
    pub const fn max_poll_interval(mut self, max: Duration) -> Self {
        self.backoff = self.backoff.max(max);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.backoff = self.backoff.jitter_ratio(jitter_ratio);
        self
    }

    pub const fn configured_deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub const fn configured_backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// `max(server hint, backoff(attempt))`, capped at the max poll interval.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let computed = self.backoff.delay(attempt);
        hint.map_or(computed, |hint| hint.max(computed))
            .min(self.backoff.configured_max())
    }
}

impl Default for AwaitOptions {
    fn default() -> Self {
        Self::standard()
    }
}

/// Classification of one poll response.
#[derive(Clone, Debug, PartialEq)]
pub enum PollOutcome {
    Pending {
        retry_after: Option<Duration>,
        queue_state: Option<String>,
    },
    Completed(Value),
    Failed(Value),
}

pub trait PollClassifier: Send + Sync {
    fn classify(&self, body: Value) -> PollOutcome;
}

/// Classifies by a string discriminator field, `status` by default. Pending
/// bodies may carry `retry_after_ms` and `queue_state`; completed bodies yield
/// their `result` member, or the whole body when there is none. A body without
/// the discriminator counts as completed.
#[derive(Clone, Debug)]
pub struct StatusFieldClassifier {
    field: String,
}

impl StatusFieldClassifier {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Default for StatusFieldClassifier {
    fn default() -> Self {
        Self::new("status")
    }
}

impl PollClassifier for StatusFieldClassifier {
    fn classify(&self, mut body: Value) -> PollOutcome {
        let status = body
            .get(&self.field)
            .and_then(Value::as_str)
            .map(str::to_ascii_lowercase);
        match status.as_deref() {
            Some(status) if PENDING_STATUSES.contains(&status) => PollOutcome::Pending {
                retry_after: body
                    .get("retry_after_ms")
                    .and_then(Value::as_f64)
                    .filter(|millis| millis.is_finite() && *millis >= 0.0)
                    .map(|millis| Duration::from_secs_f64(millis / 1000.0)),
                queue_state: body
                    .get("queue_state")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            },
            Some(status) if FAILED_STATUSES.contains(&status) => PollOutcome::Failed(body),
            Some(status) if !COMPLETED_STATUSES.contains(&status) => {
                debug!(status, "unrecognized job status; treating as pending");
                PollOutcome::Pending {
                    retry_after: None,
                    queue_state: None,
                }
            }
            _ => match body.get_mut("result").map(Value::take) {
                Some(result) => PollOutcome::Completed(result),
                None => PollOutcome::Completed(body),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FutureState {
    Submitted,
    Pending,
    Completed,
    Failed,
    TimedOut,
}

impl FutureState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

pub struct RemoteFuture {
    request_id: String,
    client: Client,
    poll_endpoint: Arc<Endpoint>,
    options: AwaitOptions,
    state: FutureState,
    attempt: u32,
    polls: u32,
    created_at: Instant,
    queue_state: Option<String>,
}

impl RemoteFuture {
    pub(crate) fn new(
        request_id: String,
        client: Client,
        poll_endpoint: Arc<Endpoint>,
        options: AwaitOptions,
    ) -> Self {
        Self {
            request_id,
            client,
            poll_endpoint,
            options,
            state: FutureState::Submitted,
            attempt: 0,
            polls: 0,
            created_at: Instant::now(),
            queue_state: None,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn state(&self) -> FutureState {
        self.state
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn queue_state(&self) -> Option<&str> {
        self.queue_state.as_deref()
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn options(&self) -> AwaitOptions {
        self.options
    }

    /// Issues exactly one retrieval call and classifies the response.
    pub async fn poll(&mut self) -> Result<PollOutcome, Error> {
        self.polls = self.polls.saturating_add(1);
        let body = self
            .client
            .poll_request(&self.poll_endpoint, &self.request_id)
            .await?;
        let outcome = self.client.poll_classifier().classify(body);
        match &outcome {
            PollOutcome::Pending { queue_state, .. } => {
                self.state = FutureState::Pending;
                if queue_state.is_some() && *queue_state != self.queue_state {
                    self.queue_state.clone_from(queue_state);
                    let metadata = Metadata::from([
                        ("request_id", self.request_id.clone()),
                        ("queue_state", queue_state.clone().unwrap_or_default()),
                    ]);
                    self.client
                        .emit(events::FUTURE_QUEUE_STATE, &Measurements::new(), &metadata);
                }
            }
            PollOutcome::Completed(_) => self.state = FutureState::Completed,
            PollOutcome::Failed(_) => self.state = FutureState::Failed,
        }
        Ok(outcome)
    }

    /// Polls until a terminal outcome using the options the future was created with.
    pub async fn wait(&mut self) -> Result<Value, Error> {
        let options = self.options;
        self.wait_with(options).await
    }

    pub async fn wait_as<T: DeserializeOwned>(&mut self) -> Result<T, Error> {
        let value = self.wait().await?;
        serde_json::from_value(value).map_err(|source| Error::Decode {
            endpoint: self.poll_endpoint.id().to_owned(),
            message: source.to_string(),
            body: String::new(),
        })
    }

    pub async fn wait_with(&mut self, options: AwaitOptions) -> Result<Value, Error> {
        let started = Instant::now();
        loop {
            let remaining = match options.deadline {
                Some(deadline) => {
                    let elapsed = started.elapsed();
                    if elapsed >= deadline {
                        return Err(self.timed_out(elapsed));
                    }
                    Some(deadline - elapsed)
                }
                None => None,
            };

            let hint = match self.poll().await {
                Ok(PollOutcome::Completed(value)) => {
                    self.record_poll("completed", Duration::ZERO);
                    self.record_resolved("completed", started);
                    return Ok(value);
                }
                Ok(PollOutcome::Failed(payload)) => {
                    self.record_poll("failed", Duration::ZERO);
                    self.record_resolved("failed", started);
                    return Err(Error::FutureFailed {
                        request_id: self.request_id.clone(),
                        payload,
                    });
                }
                Ok(PollOutcome::Pending { retry_after, .. }) => retry_after,
                Err(error) if is_retryable_poll_error(&error) => {
                    warn!(
                        request_id = %self.request_id,
                        polls = self.polls,
                        error = %error,
                        "poll failed; retrying"
                    );
                    error.retry_after()
                }
                Err(error) => {
                    self.record_resolved("error", started);
                    return Err(error);
                }
            };

            let mut delay = options.delay_for(self.attempt, hint);
            if let Some(remaining) = remaining {
                delay = delay.min(remaining);
            }
            self.attempt = self.attempt.saturating_add(1);
            self.record_poll("pending", delay);
            tokio::time::sleep(delay).await;
        }
    }

    fn timed_out(&mut self, elapsed: Duration) -> Error {
        self.state = FutureState::TimedOut;
        warn!(
            request_id = %self.request_id,
            polls = self.polls,
            elapsed_ms = elapsed.as_millis() as u64,
            "future deadline exceeded"
        );
        let metadata = Metadata::from([
            ("request_id", self.request_id.clone()),
            ("outcome", FutureState::TimedOut.as_str().to_owned()),
        ]);
        let measurements = Measurements::from([
            ("polls", f64::from(self.polls)),
            ("elapsed_ms", elapsed.as_secs_f64() * 1000.0),
        ]);
        self.client
            .emit(events::FUTURE_RESOLVED, &measurements, &metadata);
        Error::FutureTimeout {
            request_id: self.request_id.clone(),
            elapsed_ms: elapsed.as_millis(),
            polls: self.polls,
        }
    }

    fn record_poll(&self, outcome: &str, delay: Duration) {
        let metadata = Metadata::from([
            ("request_id", self.request_id.clone()),
            ("outcome", outcome.to_owned()),
        ]);
        let measurements = Measurements::from([
            ("attempt", f64::from(self.attempt)),
            ("delay_ms", delay.as_secs_f64() * 1000.0),
        ]);
        self.client.emit(events::FUTURE_POLL, &measurements, &metadata);
    }

    fn record_resolved(&self, outcome: &str, started: Instant) {
        let metadata = Metadata::from([
            ("request_id", self.request_id.clone()),
            ("outcome", outcome.to_owned()),
        ]);
        let measurements = Measurements::from([
            ("polls", f64::from(self.polls)),
            ("elapsed_ms", started.elapsed().as_secs_f64() * 1000.0),
        ]);
        self.client
            .emit(events::FUTURE_RESOLVED, &measurements, &metadata);
    }
}

impl std::fmt::Debug for RemoteFuture {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RemoteFuture")
            .field("request_id", &self.request_id)
            .field("poll_endpoint", &self.poll_endpoint.id())
            .field("state", &self.state)
            .field("polls", &self.polls)
            .finish_non_exhaustive()
    }
}

fn is_retryable_poll_error(error: &Error) -> bool {
    error.is_retryable() || error.category() == ErrorCategory::CircuitOpen
}

/// Waits for every future and returns their results in input order.
pub async fn await_many(futures: Vec<RemoteFuture>) -> Vec<Result<Value, Error>> {
    join_all(
        futures
            .into_iter()
            .map(|mut future| async move { future.wait().await }),
    )
    .await
}

/// Yields `(index, result)` pairs as the futures resolve.
pub fn await_stream(
    futures: Vec<RemoteFuture>,
) -> impl Stream<Item = (usize, Result<Value, Error>)> + Send {
    futures
        .into_iter()
        .enumerate()
        .map(|(index, mut future)| async move { (index, future.wait().await) })
        .collect::<FuturesUnordered<_>>()
        .boxed()
}
