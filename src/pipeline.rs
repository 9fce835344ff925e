//! Request execution: build, send through the resilience layers, decode.
//!
//! Retry is the outermost loop and re-sends the same [`Request`]. Every
//! attempt waits on the destination's rate-limit window, takes in-flight byte
//! budget, passes the endpoint's circuit breaker and only then reaches the
//! transport. Decoding happens once, after the loop, and is never retried.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use futures_util::StreamExt;
use http::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use http::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{Instrument, debug, error, info_span, warn};

use crate::client::Client;
use crate::codec::{CodecContext, encode_body};
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorCategory};
use crate::future::RemoteFuture;
use crate::request::{CallOptions, Request};
use crate::response::{Response, StreamResponse, StreamingResponse};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::sse::decode_stream;
use crate::telemetry::{Measurements, Metadata, events};
use crate::util::{
    append_query_pairs, expand_path_template, join_base_path, merge_headers, parse_header_name,
    parse_header_value, parse_retry_after, redact_uri_for_logs, truncate_body,
};

const EVENT_STREAM: &str = "text/event-stream";

/// What a call produced, depending on the endpoint's flags.
#[derive(Debug)]
pub enum Outcome {
    Value(Value),
    Future(RemoteFuture),
    Stream(StreamResponse),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attempts {
    /// Use the endpoint's retry policy.
    Policy,
    /// One attempt; the caller owns any repetition (the poller does).
    Single,
}

impl Client {
    /// Calls a buffered endpoint and decodes the response into `R`.
    pub async fn execute<P, R>(
        &self,
        endpoint: &Endpoint,
        payload: &P,
        options: CallOptions,
    ) -> crate::Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let span = request_span(endpoint, "buffered");
        self.call_buffered(endpoint, payload, &options, Attempts::Policy, |value| {
            decode_typed(endpoint, value)
        })
        .instrument(span)
        .await
    }

    pub async fn execute_value<P>(
        &self,
        endpoint: &Endpoint,
        payload: &P,
        options: CallOptions,
    ) -> crate::Result<Value>
    where
        P: Serialize + ?Sized,
    {
        let span = request_span(endpoint, "buffered");
        self.call_buffered(endpoint, payload, &options, Attempts::Policy, Ok)
            .instrument(span)
            .await
    }

    /// Submits a job to an async endpoint and returns a handle to poll it.
    pub async fn execute_async<P>(
        &self,
        endpoint: &Endpoint,
        payload: &P,
        options: CallOptions,
    ) -> crate::Result<RemoteFuture>
    where
        P: Serialize + ?Sized,
    {
        let poll_endpoint = endpoint.poll().ok_or_else(|| Error::MissingPollEndpoint {
            endpoint: endpoint.id().to_owned(),
        })?;
        let span = request_span(endpoint, "async");
        let ack = self
            .call_buffered(endpoint, payload, &options, Attempts::Policy, Ok)
            .instrument(span)
            .await?;
        let request_id = request_id_of(&ack).ok_or_else(|| Error::MissingRequestId {
            endpoint: endpoint.id().to_owned(),
        })?;
        debug!(endpoint = endpoint.id(), request_id, "async job accepted");
        Ok(RemoteFuture::new(
            request_id,
            self.clone(),
            Arc::new(poll_endpoint.clone()),
            options.await_options.unwrap_or(self.inner.await_options),
        ))
    }

    /// Opens an event stream. Events are decoded lazily as the body arrives.
    pub async fn execute_stream<P>(
        &self,
        endpoint: &Endpoint,
        payload: &P,
        options: CallOptions,
    ) -> crate::Result<StreamResponse>
    where
        P: Serialize + ?Sized,
    {
        let span = request_span(endpoint, "stream");
        self.call_stream(endpoint, payload, &options)
            .instrument(span)
            .await
    }

    /// Dispatches on the endpoint's flags: streaming endpoints yield a stream,
    /// async endpoints a future, everything else a decoded value.
    pub async fn invoke<P>(
        &self,
        endpoint: &Endpoint,
        payload: &P,
        options: CallOptions,
    ) -> crate::Result<Outcome>
    where
        P: Serialize + ?Sized,
    {
        if endpoint.is_streaming() {
            return self
                .execute_stream(endpoint, payload, options)
                .await
                .map(Outcome::Stream);
        }
        if endpoint.is_async() {
            return self
                .execute_async(endpoint, payload, options)
                .await
                .map(Outcome::Future);
        }
        self.execute_value(endpoint, payload, options)
            .await
            .map(Outcome::Value)
    }

    /// One status retrieval for a job; the poller decides about repeating it.
    pub(crate) async fn poll_request(
        &self,
        poll_endpoint: &Endpoint,
        request_id: &str,
    ) -> crate::Result<Value> {
        let options = CallOptions::new().path_param("request_id", request_id);
        let method = poll_endpoint.method();
        let payload = if *method == Method::GET || *method == Method::HEAD || *method == Method::DELETE
        {
            Value::Null
        } else {
            json!({ "request_id": request_id })
        };
        let span = request_span(poll_endpoint, "poll");
        self.call_buffered(poll_endpoint, &payload, &options, Attempts::Single, Ok)
            .instrument(span)
            .await
    }

    /// `convert` runs inside the call trace, so a failed typed decode is
    /// reported as a failed call.
    async fn call_buffered<P, T, F>(
        &self,
        endpoint: &Endpoint,
        payload: &P,
        options: &CallOptions,
        attempts: Attempts,
        convert: F,
    ) -> crate::Result<T>
    where
        P: Serialize + ?Sized,
        F: FnOnce(Value) -> crate::Result<T>,
    {
        let mut trace = CallTrace::start(self, endpoint);
        let result = async {
            let request = self.prepare(endpoint, payload, options, false)?;
            let transport = self.inner.transport.as_ref();
            let sent = &request;
            let response = self
                .send_with_resilience(endpoint, &request, options, attempts, &mut trace, move || {
                    async move {
                        let response = transport.send(sent).await?;
                        ensure_success(sent, response)
                    }
                })
                .await?;
            trace.status = Some(response.status());
            self.decode_response(endpoint, &response).and_then(convert)
        }
        .await;
        trace.finish(&result);
        result
    }

    async fn call_stream<P>(
        &self,
        endpoint: &Endpoint,
        payload: &P,
        options: &CallOptions,
    ) -> crate::Result<StreamResponse>
    where
        P: Serialize + ?Sized,
    {
        let mut trace = CallTrace::start(self, endpoint);
        let result = async {
            let transport = self
                .inner
                .streaming_transport
                .as_deref()
                .ok_or(Error::MissingTransport { kind: "streaming" })?;
            let request = self.prepare(endpoint, payload, options, true)?;
            let sent = &request;
            let response = self
                .send_with_resilience(
                    endpoint,
                    &request,
                    options,
                    Attempts::Policy,
                    &mut trace,
                    move || async move {
                        let response = transport.send_streaming(sent).await?;
                        ensure_streaming_success(sent, response).await
                    },
                )
                .await?;
            trace.status = Some(response.status());
            let status = response.status();
            let headers = response.headers().clone();
            let events = decode_stream(response.into_chunks()).boxed();
            Ok::<_, Error>(StreamResponse::new(status, headers, events))
        }
        .await;
        trace.finish(&result);
        result
    }

    /// Builds the request: body, path, query, headers, auth, idempotency key.
    fn prepare<P>(
        &self,
        endpoint: &Endpoint,
        payload: &P,
        options: &CallOptions,
        streaming: bool,
    ) -> crate::Result<Request>
    where
        P: Serialize + ?Sized,
    {
        let context = &self.inner;
        let payload = guard(endpoint, "payload serialization", || {
            serde_json::to_value(payload).map_err(|source| Error::Encode {
                endpoint: endpoint.id().to_owned(),
                message: source.to_string(),
            })
        })?;
        let codec_context = CodecContext {
            endpoint: endpoint.id(),
            type_ref: endpoint.request_type_ref(),
        };
        let encoded = guard(endpoint, "request encoding", || {
            encode_body(
                endpoint.configured_body_kind(),
                context.serializer.as_ref(),
                &payload,
                codec_context,
            )
        })?;

        let path = expand_path_template(endpoint.id(), endpoint.path(), &options.path_params)?;
        let query_pairs: Vec<(String, String)> = endpoint
            .default_query()
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .chain(options.query_pairs.iter().cloned())
            .collect();
        let url = join_base_path(&context.base_url, &append_query_pairs(&path, &query_pairs));

        let mut endpoint_headers = HeaderMap::new();
        for (name, value) in endpoint.default_headers() {
            let name = parse_header_name(name)?;
            let value = parse_header_value(name.as_str(), value)?;
            endpoint_headers.insert(name, value);
        }
        let mut headers =
            merge_headers([&context.default_headers, &endpoint_headers, &options.headers]);
        for provider in &context.auth {
            let auth_headers = provider.headers(options)?;
            headers = merge_headers([&headers, &auth_headers]);
        }
        if let Some(content_type) = encoded.content_type
            && !headers.contains_key(CONTENT_TYPE)
        {
            headers.insert(CONTENT_TYPE, content_type);
        }
        if streaming && !headers.contains_key(ACCEPT) {
            headers.insert(ACCEPT, HeaderValue::from_static(EVENT_STREAM));
        }
        if endpoint.is_idempotent() {
            let key = match &options.idempotency_key {
                Some(key) => key.clone(),
                None => uuid::Uuid::new_v4().to_string(),
            };
            let value = parse_header_value(context.idempotency_header.as_str(), &key)?;
            headers.insert(context.idempotency_header.clone(), value);
        }

        Ok(Request::new(endpoint.id(), endpoint.method().clone(), url)
            .with_headers(headers)
            .with_body(encoded.bytes)
            .with_timeout(options.timeout.or(context.request_timeout)))
    }

    /// Drives `send` through limiter, budget, breaker and timeout, retrying
    /// per the endpoint's policy. `send` must re-issue the same `request`.
    async fn send_with_resilience<T, F, Fut>(
        &self,
        endpoint: &Endpoint,
        request: &Request,
        options: &CallOptions,
        attempts: Attempts,
        trace: &mut CallTrace<'_>,
        send: F,
    ) -> crate::Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let context = &self.inner;
        let disabled;
        let retry_policy: &RetryPolicy = match attempts {
            Attempts::Policy => context.retry_policy_for(endpoint.retry_policy_name())?,
            Attempts::Single => {
                disabled = RetryPolicy::disabled();
                &disabled
            }
        };
        let breaker_policy =
            context.circuit_breaker_policy_for(endpoint.circuit_breaker_policy_name())?;
        let rate_limit_policy = context.rate_limit_policy_for(endpoint.rate_limit_policy_name())?;
        let breaker = context
            .breakers
            .get_or_create(endpoint.breaker_key(), breaker_policy);
        let max_attempts = retry_policy.configured_max_attempts();
        let body_bytes = request.body().len() as u64;

        let send = &send;
        let mut attempt = 1_u32;
        loop {
            trace.attempts = attempt;
            context.rate_limiter.wait(&context.destination).await;

            let permit = match &context.byte_budget {
                Some(budget) => Some(
                    budget
                        .acquire_permit(body_bytes, options.budget_timeout)
                        .await?,
                ),
                None => None,
            };

            debug!(
                attempt,
                max_attempts,
                uri = %redact_uri_for_logs(request.url()),
                "sending attempt"
            );
            let result = breaker
                .call_with(
                    move || async move {
                        match request.timeout() {
                            Some(limit) => tokio::time::timeout(limit, send())
                                .await
                                .unwrap_or_else(|_| {
                                    Err(Error::Timeout {
                                        timeout_ms: limit.as_millis(),
                                        method: request.method().clone(),
                                        uri: redact_uri_for_logs(request.url()),
                                    })
                                }),
                            None => send().await,
                        }
                    },
                    |result| result.as_ref().err().is_none_or(|error| !trips_breaker(error)),
                )
                .await;
            drop(permit);

            let error = match result {
                Ok(value) => {
                    debug!(attempt, "attempt succeeded");
                    return Ok(value);
                }
                Err(error) => error,
            };

            match error.category() {
                ErrorCategory::RateLimit => {
                    let pause = rate_limit_policy.pause_for(error.retry_after());
                    context
                        .rate_limiter
                        .observe_throttle(&context.destination, pause);
                    self.emit(
                        events::RATE_LIMIT_BACKOFF,
                        &Measurements::from([("delay_ms", pause.as_secs_f64() * 1000.0)]),
                        &Metadata::from([
                            ("endpoint", endpoint.id().to_owned()),
                            ("destination", redact_uri_for_logs(&context.base_url)),
                        ]),
                    );
                }
                ErrorCategory::CircuitOpen => {
                    self.emit(
                        events::CIRCUIT_REJECTED,
                        &Measurements::from([(
                            "retry_after_ms",
                            error
                                .retry_after()
                                .map_or(0.0, |delay| delay.as_secs_f64() * 1000.0),
                        )]),
                        &Metadata::from([
                            ("endpoint", endpoint.id().to_owned()),
                            ("breaker", endpoint.breaker_key().to_owned()),
                        ]),
                    );
                }
                _ => {}
            }

            let decision = RetryDecision::for_error(
                attempt,
                max_attempts,
                endpoint.id(),
                request.method(),
                &error,
            );
            if !retry_policy.should_retry(&decision) {
                return Err(error);
            }

            let delay = retry_policy.delay_after(attempt, error.retry_after());
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                category = %error.category(),
                error = %error,
                "attempt failed; retrying"
            );
            self.emit(
                events::REQUEST_RETRY,
                &Measurements::from([
                    ("attempt", f64::from(attempt)),
                    ("delay_ms", delay.as_secs_f64() * 1000.0),
                ]),
                &Metadata::from([
                    ("endpoint", endpoint.id().to_owned()),
                    ("category", error.category().as_str().to_owned()),
                ]),
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn decode_response(&self, endpoint: &Endpoint, response: &Response) -> crate::Result<Value> {
        let codec_context = CodecContext {
            endpoint: endpoint.id(),
            type_ref: endpoint.response_type_ref(),
        };
        guard(endpoint, "response decoding", || {
            self.inner.serializer.decode(response.body(), codec_context)
        })
    }
}

fn request_span(endpoint: &Endpoint, kind: &'static str) -> tracing::Span {
    info_span!(
        "pristine.request",
        endpoint = endpoint.id(),
        method = %endpoint.method(),
        kind
    )
}

fn decode_typed<R: DeserializeOwned>(endpoint: &Endpoint, value: Value) -> crate::Result<R> {
    guard(endpoint, "response decoding", || {
        serde_json::from_value(value).map_err(|source| Error::Decode {
            endpoint: endpoint.id().to_owned(),
            message: match endpoint.response_type_ref() {
                Some(type_ref) => format!("expected {type_ref}: {source}"),
                None => source.to_string(),
            },
            body: String::new(),
        })
    })
}

/// Throttling proves the dependency is alive; only faults count against it.
fn trips_breaker(error: &Error) -> bool {
    matches!(
        error.category(),
        ErrorCategory::ServerError | ErrorCategory::RequestTimeout | ErrorCategory::Connection
    )
}

fn request_id_of(ack: &Value) -> Option<String> {
    match ack.get("request_id")? {
        Value::String(request_id) if !request_id.is_empty() => Some(request_id.clone()),
        Value::Number(request_id) => Some(request_id.to_string()),
        _ => None,
    }
}

fn status_error(request: &Request, response: &Response) -> Error {
    let status = response.status();
    Error::HttpStatus {
        status: status.as_u16(),
        category: ErrorCategory::from_status(status),
        method: request.method().clone(),
        uri: redact_uri_for_logs(request.url()),
        retry_after: parse_retry_after(response.headers(), SystemTime::now()),
        body: truncate_body(response.body()),
    }
}

fn ensure_success(request: &Request, response: Response) -> crate::Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(status_error(request, &response))
    }
}

async fn ensure_streaming_success(
    request: &Request,
    response: StreamingResponse,
) -> crate::Result<StreamingResponse> {
    if response.status().is_success() {
        return Ok(response);
    }
    let response = response.collect().await?;
    Err(status_error(request, &response))
}

/// Runs serializer code, turning a panic into [`Error::Internal`].
fn guard<T>(
    endpoint: &Endpoint,
    stage: &str,
    work: impl FnOnce() -> crate::Result<T>,
) -> crate::Result<T> {
    match catch_unwind(AssertUnwindSafe(work)) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(endpoint = endpoint.id(), stage, panic = %message, "serializer panicked");
            Err(Error::Internal {
                message: format!("{stage} panicked for {}: {message}", endpoint.id()),
            })
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Start/stop telemetry for one logical call.
struct CallTrace<'a> {
    client: &'a Client,
    endpoint: &'a Endpoint,
    started: Instant,
    attempts: u32,
    status: Option<StatusCode>,
}

impl<'a> CallTrace<'a> {
    fn start(client: &'a Client, endpoint: &'a Endpoint) -> Self {
        client.emit(
            events::REQUEST_START,
            &Measurements::new(),
            &Metadata::from([
                ("endpoint", endpoint.id().to_owned()),
                ("method", endpoint.method().to_string()),
            ]),
        );
        Self {
            client,
            endpoint,
            started: Instant::now(),
            attempts: 0,
            status: None,
        }
    }

    fn finish<T>(self, result: &crate::Result<T>) {
        let measurements = Measurements::from([
            ("duration_ms", self.started.elapsed().as_secs_f64() * 1000.0),
            ("attempts", f64::from(self.attempts)),
        ]);
        let mut metadata = Metadata::from([
            ("endpoint", self.endpoint.id().to_owned()),
            ("method", self.endpoint.method().to_string()),
        ]);
        match result {
            Ok(_) => {
                if let Some(status) = self.status {
                    metadata.insert("status", status.as_u16().to_string());
                }
                self.client
                    .emit(events::REQUEST_STOP, &measurements, &metadata);
            }
            Err(error) => {
                if let Some(status) = error.status().or(self.status) {
                    metadata.insert("status", status.as_u16().to_string());
                }
                metadata.insert("category", error.category().as_str().to_owned());
                metadata.insert("code", error.code().as_str().to_owned());
                self.client
                    .emit(events::REQUEST_EXCEPTION, &measurements, &metadata);
            }
        }
    }
}
