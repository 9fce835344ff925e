//! `pristine` is a manifest-driven API runtime for generated SDKs.
//!
//! Endpoints are described as data ([`Endpoint`]) and executed by a shared
//! [`Client`] that owns the request pipeline: retry with backoff, a per
//! destination rate-limit window, circuit breakers, an in-flight byte budget,
//! SSE decoding for streaming endpoints and polling for async job endpoints.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use pristine::prelude::{BearerAuth, CallOptions, Client, Endpoint, RetryPolicy};
//! use serde::Deserialize;
//! use std::sync::Arc;
//!
//! #[derive(Debug, Deserialize)]
//! struct Completion {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("https://api.example.com")
//!         .auth(Arc::new(BearerAuth::new("secret-token")?))
//!         .request_timeout(Duration::from_secs(10))
//!         .retry_policy(RetryPolicy::standard().max_attempts(4))
//!         .try_build()?;
//!
//!     let create = Endpoint::post("completions.create", "/v1/completions")
//!         .response_type("Completion")
//!         .idempotent(true);
//!
//!     let completion: Completion = client
//!         .execute(
//!             &create,
//!             &serde_json::json!({ "prompt": "hello" }),
//!             CallOptions::new().idempotency_key("completion-001"),
//!         )
//!         .await?;
//!
//!     println!("completion id={}", completion.id);
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Mark non-GET endpoints that the server deduplicates as `idempotent`.
//! - Load endpoint tables with [`Endpoint::list_from_json`] and keep one
//!   [`Client`] per destination and credential.
//! - Poll async jobs with an explicit deadline in [`AwaitOptions`].

mod auth;
mod backoff;
mod budget;
mod circuit_breaker;
mod client;
mod codec;
mod config;
mod endpoint;
mod error;
mod future;
mod metrics;
mod pipeline;
mod rate_limit;
mod request;
mod response;
mod retry;
pub mod sse;
mod telemetry;
mod transport;
mod util;

pub use crate::auth::{ApiKeyAuth, AuthProvider, BearerAuth};
pub use crate::backoff::{BackoffPolicy, delay as backoff_delay, delay_with as backoff_delay_with};
pub use crate::budget::{ByteBudget, BytePermit};
pub use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerPolicy, CircuitBreakerRegistry, CircuitState,
    SharedCircuitBreaker,
};
pub use crate::client::{Client, ClientBuilder, DEFAULT_IDEMPOTENCY_HEADER};
pub use crate::codec::{
    CodecContext, EncodedBody, JsonSerializer, Serializer, encode_body, encode_multipart,
};
pub use crate::config::{ClientProfile, ProfileDefaults};
pub use crate::endpoint::{BodyKind, Endpoint};
pub use crate::error::{Error, ErrorCategory, ErrorCode};
pub use crate::future::{
    AwaitOptions, FutureState, PollClassifier, PollOutcome, RemoteFuture, StatusFieldClassifier,
    await_many, await_stream,
};
pub use crate::metrics::{PipelineMetrics, PipelineMetricsSnapshot};
pub use crate::pipeline::Outcome;
pub use crate::rate_limit::{
    BackoffRegistry, BackoffWindow, NoopRateLimiter, RateLimitPolicy, RateLimiter,
    destination_key,
};
pub use crate::request::{CallOptions, Request};
pub use crate::response::{ChunkStream, EventStream, Response, StreamResponse, StreamingResponse};
pub use crate::retry::{RetryClassifier, RetryDecision, RetryPolicy};
pub use crate::sse::Event;
pub use crate::telemetry::{
    Measurements, Metadata, NoopTelemetry, TelemetrySink, TracingTelemetry, events,
};
#[cfg(feature = "hyper-transport")]
pub use crate::transport::{HyperTransport, HyperTransportOptions};
pub use crate::transport::{StreamingTransport, Transport};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        ApiKeyAuth, AuthProvider, AwaitOptions, BearerAuth, BodyKind, CallOptions,
        CircuitBreakerPolicy, Client, ClientProfile, Endpoint, Error, ErrorCategory, ErrorCode,
        Event, Outcome, RateLimitPolicy, RemoteFuture, Response, Result, RetryPolicy,
        StreamResponse,
    };
}
