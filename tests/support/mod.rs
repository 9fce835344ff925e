#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use pristine::{
    Error, Measurements, Metadata, Request, Response, RetryPolicy, StreamingResponse,
    StreamingTransport, TelemetrySink, Transport,
};

pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// What the mock transport does for one request.
#[derive(Clone, Debug)]
pub struct Step {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    delay: Duration,
    chunk_size: usize,
    refuse: bool,
}

impl Step {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            delay: Duration::ZERO,
            chunk_size: usize::MAX,
            refuse: false,
        }
    }

    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self::status(status)
            .header("content-type", "application/json")
            .body(body.to_string())
    }

    pub fn refused() -> Self {
        Self {
            refuse: true,
            ..Self::status(0)
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Splits the body into chunks of `size` bytes on the streaming path.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    fn head(&self) -> (StatusCode, HeaderMap) {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            headers.append(
                HeaderName::from_bytes(name.as_bytes()).expect("valid mock header name"),
                HeaderValue::from_str(value).expect("valid mock header value"),
            );
        }
        (status, headers)
    }
}

type Responder = dyn Fn(&Request, usize) -> Step + Send + Sync;

/// In-memory transport answering from a responder function and recording
/// every request it sees.
pub struct MockTransport {
    responder: Box<Responder>,
    requests: Mutex<Vec<Request>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockTransport {
    pub fn new(responder: impl Fn(&Request, usize) -> Step + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    /// Replays `steps` in order; the last one repeats once the script runs out.
    pub fn sequence(steps: Vec<Step>) -> Arc<Self> {
        let last = steps.last().cloned().unwrap_or_else(|| Step::status(200));
        let steps = Mutex::new(VecDeque::from(steps));
        Self::new(move |_, _| lock_unpoisoned(&steps).pop_front().unwrap_or_else(|| last.clone()))
    }

    pub fn requests(&self) -> Vec<Request> {
        lock_unpoisoned(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock_unpoisoned(&self.requests).len()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn step_for(&self, request: &Request) -> Result<Step, Error> {
        let index = {
            let mut requests = lock_unpoisoned(&self.requests);
            requests.push(request.clone());
            requests.len() - 1
        };
        let step = (self.responder)(request, index);

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if step.refuse {
            return Err(Error::Connection {
                method: request.method().clone(),
                uri: request.url().to_owned(),
                source: "connection refused".into(),
            });
        }
        Ok(step)
    }
}

impl Transport for MockTransport {
    fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, Error>> {
        Box::pin(async move {
            let step = self.step_for(request).await?;
            let (status, headers) = step.head();
            Ok(Response::new(status, headers, step.body))
        })
    }
}

impl StreamingTransport for MockTransport {
    fn send_streaming<'a>(
        &'a self,
        request: &'a Request,
    ) -> BoxFuture<'a, Result<StreamingResponse, Error>> {
        Box::pin(async move {
            let step = self.step_for(request).await?;
            let (status, headers) = step.head();
            let chunks: Vec<Result<Bytes, Error>> = step
                .body
                .chunks(step.chunk_size)
                .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
                .collect();
            Ok(StreamingResponse::new(
                status,
                headers,
                stream::iter(chunks).boxed(),
            ))
        })
    }
}

/// Telemetry sink that keeps every event for assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, Measurements, Metadata)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn named(&self, name: &str) -> Vec<(Measurements, Metadata)> {
        lock_unpoisoned(&self.events)
            .iter()
            .filter(|(event, _, _)| event == name)
            .map(|(_, measurements, metadata)| (measurements.clone(), metadata.clone()))
            .collect()
    }
}

impl TelemetrySink for RecordingSink {
    fn emit(&self, name: &str, measurements: &Measurements, metadata: &Metadata) {
        lock_unpoisoned(&self.events).push((
            name.to_owned(),
            measurements.clone(),
            metadata.clone(),
        ));
    }
}

/// Retries with millisecond backoff so tests stay fast.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::standard()
        .max_attempts(max_attempts)
        .base_backoff(Duration::from_millis(1))
        .max_backoff(Duration::from_millis(4))
        .jitter_ratio(0.0)
}

pub fn header<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}
