use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};

use crate::auth::AuthProvider;
use crate::budget::ByteBudget;
use crate::circuit_breaker::{CircuitBreakerPolicy, CircuitBreakerRegistry};
use crate::codec::{JsonSerializer, Serializer};
use crate::config::ClientProfile;
use crate::error::Error;
use crate::future::{AwaitOptions, PollClassifier, StatusFieldClassifier};
use crate::metrics::{PipelineMetrics, PipelineMetricsSnapshot};
use crate::rate_limit::{BackoffRegistry, RateLimitPolicy, RateLimiter, destination_key};
use crate::retry::RetryPolicy;
use crate::telemetry::{Measurements, Metadata, Telemetry, TelemetrySink, TracingTelemetry};
use crate::transport::{StreamingTransport, Transport};
use crate::util::{parse_header_name, parse_header_value, validate_base_url};

pub const DEFAULT_IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Immutable per-client strategies shared by every concurrent call.
pub(crate) struct Context {
    pub(crate) base_url: String,
    pub(crate) destination: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) streaming_transport: Option<Arc<dyn StreamingTransport>>,
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) auth: Vec<Arc<dyn AuthProvider>>,
    pub(crate) telemetry: Telemetry,
    pub(crate) default_headers: HeaderMap,
    pub(crate) idempotency_header: HeaderName,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) retry_policies: BTreeMap<String, RetryPolicy>,
    pub(crate) circuit_breaker_policy: CircuitBreakerPolicy,
    pub(crate) circuit_breaker_policies: BTreeMap<String, CircuitBreakerPolicy>,
    pub(crate) breakers: Arc<CircuitBreakerRegistry>,
    pub(crate) rate_limit_policy: RateLimitPolicy,
    pub(crate) rate_limit_policies: BTreeMap<String, RateLimitPolicy>,
    pub(crate) rate_limiter: Arc<dyn RateLimiter>,
    pub(crate) byte_budget: Option<Arc<ByteBudget>>,
    pub(crate) await_options: AwaitOptions,
    pub(crate) poll_classifier: Arc<dyn PollClassifier>,
    pub(crate) metrics: Option<Arc<PipelineMetrics>>,
}

impl Context {
    pub(crate) fn retry_policy_for(&self, name: Option<&str>) -> Result<&RetryPolicy, Error> {
        lookup_policy("retry", &self.retry_policies, name, &self.retry_policy)
    }

    pub(crate) fn circuit_breaker_policy_for(
        &self,
        name: Option<&str>,
    ) -> Result<CircuitBreakerPolicy, Error> {
        lookup_policy(
            "circuit_breaker",
            &self.circuit_breaker_policies,
            name,
            &self.circuit_breaker_policy,
        )
        .copied()
    }

    pub(crate) fn rate_limit_policy_for(
        &self,
        name: Option<&str>,
    ) -> Result<RateLimitPolicy, Error> {
        lookup_policy(
            "rate_limit",
            &self.rate_limit_policies,
            name,
            &self.rate_limit_policy,
        )
        .copied()
    }
}

fn lookup_policy<'a, P>(
    kind: &'static str,
    named: &'a BTreeMap<String, P>,
    name: Option<&str>,
    fallback: &'a P,
) -> Result<&'a P, Error> {
    match name {
        None => Ok(fallback),
        Some(name) => named.get(name).ok_or_else(|| Error::UnknownPolicy {
            kind,
            name: name.to_owned(),
        }),
    }
}

pub struct ClientBuilder {
    base_url: String,
    profile: ClientProfile,
    transport: Option<Arc<dyn Transport>>,
    streaming_transport: Option<Arc<dyn StreamingTransport>>,
    serializer: Arc<dyn Serializer>,
    auth: Vec<Arc<dyn AuthProvider>>,
    telemetry: Vec<Arc<dyn TelemetrySink>>,
    default_headers: HeaderMap,
    idempotency_header: HeaderName,
    credential: Option<String>,
    request_timeout: Option<Option<Duration>>,
    retry_policy: Option<RetryPolicy>,
    retry_policies: BTreeMap<String, RetryPolicy>,
    circuit_breaker_policy: Option<CircuitBreakerPolicy>,
    circuit_breaker_policies: BTreeMap<String, CircuitBreakerPolicy>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    rate_limit_policy: Option<RateLimitPolicy>,
    rate_limit_policies: BTreeMap<String, RateLimitPolicy>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    byte_budget: Option<Option<Arc<ByteBudget>>>,
    await_options: Option<AwaitOptions>,
    poll_classifier: Arc<dyn PollClassifier>,
    metrics_enabled: bool,
}

impl ClientBuilder {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            profile: ClientProfile::StandardSdk,
            transport: None,
            streaming_transport: None,
            serializer: Arc::new(JsonSerializer::new()),
            auth: Vec::new(),
            telemetry: Vec::new(),
            default_headers: HeaderMap::new(),
            idempotency_header: HeaderName::from_static(DEFAULT_IDEMPOTENCY_HEADER),
            credential: None,
            request_timeout: None,
            retry_policy: None,
            retry_policies: BTreeMap::new(),
            circuit_breaker_policy: None,
            circuit_breaker_policies: BTreeMap::new(),
            breakers: None,
            rate_limit_policy: None,
            rate_limit_policies: BTreeMap::new(),
            rate_limiter: None,
            byte_budget: None,
            await_options: None,
            poll_classifier: Arc::new(StatusFieldClassifier::default()),
            metrics_enabled: false,
        }
    }

    /// Preset whose defaults apply to every setting not configured explicitly.
    pub fn profile(mut self, profile: ClientProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn streaming_transport(mut self, transport: Arc<dyn StreamingTransport>) -> Self {
        self.streaming_transport = Some(transport);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Adds an auth provider; providers apply in the order they were added.
    pub fn auth(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth.push(provider);
        self
    }

    /// Adds a telemetry sink. Without any, events go to `tracing`.
    pub fn telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry.push(sink);
        self
    }

    pub fn metrics(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn idempotency_header(mut self, name: HeaderName) -> Self {
        self.idempotency_header = name;
        self
    }

    /// Credential used to key shared rate-limit state when no auth provider
    /// exposes one.
    pub fn credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(Some(timeout));
        self
    }

    pub fn no_request_timeout(mut self) -> Self {
        self.request_timeout = Some(None);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn retry_policy_named(mut self, name: impl Into<String>, policy: RetryPolicy) -> Self {
        self.retry_policies.insert(name.into(), policy);
        self
    }

    pub fn circuit_breaker_policy(mut self, policy: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker_policy = Some(policy);
        self
    }

    pub fn circuit_breaker_policy_named(
        mut self,
        name: impl Into<String>,
        policy: CircuitBreakerPolicy,
    ) -> Self {
        self.circuit_breaker_policies.insert(name.into(), policy);
        self
    }

    /// Shares breaker state with other clients built from the same registry.
    pub fn circuit_breaker_registry(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(registry);
        self
    }

    pub fn rate_limit_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit_policy = Some(policy);
        self
    }

    pub fn rate_limit_policy_named(
        mut self,
        name: impl Into<String>,
        policy: RateLimitPolicy,
    ) -> Self {
        self.rate_limit_policies.insert(name.into(), policy);
        self
    }

    /// Shares backoff windows with other clients using the same limiter.
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Bounds in-flight request body bytes across all calls of this client.
    pub fn max_in_flight_bytes(mut self, max_bytes: u64) -> Self {
        self.byte_budget = Some(Some(Arc::new(ByteBudget::new(max_bytes))));
        self
    }

    pub fn byte_budget(mut self, budget: Arc<ByteBudget>) -> Self {
        self.byte_budget = Some(Some(budget));
        self
    }

    pub fn no_byte_budget(mut self) -> Self {
        self.byte_budget = Some(None);
        self
    }

    pub fn await_options(mut self, options: AwaitOptions) -> Self {
        self.await_options = Some(options);
        self
    }

    pub fn poll_classifier(mut self, classifier: Arc<dyn PollClassifier>) -> Self {
        self.poll_classifier = classifier;
        self
    }

    pub fn try_build(self) -> crate::Result<Client> {
        validate_base_url(&self.base_url)?;
        let defaults = self.profile.defaults();

        let (transport, streaming_transport) =
            resolve_transports(self.transport, self.streaming_transport)?;

        let credential = self
            .auth
            .iter()
            .find_map(|provider| provider.credential().map(str::to_owned))
            .or(self.credential);
        let destination = destination_key(self.base_url.trim(), credential.as_deref());

        let metrics = self.metrics_enabled.then(|| Arc::new(PipelineMetrics::new()));
        let mut sinks = self.telemetry;
        if sinks.is_empty() {
            sinks.push(Arc::new(TracingTelemetry));
        }
        if let Some(metrics) = &metrics {
            sinks.push(metrics.clone());
        }

        let byte_budget = match self.byte_budget {
            Some(configured) => configured,
            None => defaults
                .max_in_flight_bytes
                .map(|max_bytes| Arc::new(ByteBudget::new(max_bytes))),
        };

        Ok(Client {
            inner: Arc::new(Context {
                base_url: self.base_url.trim().trim_end_matches('/').to_owned(),
                destination,
                transport,
                streaming_transport,
                serializer: self.serializer,
                auth: self.auth,
                telemetry: Telemetry::new(sinks),
                default_headers: self.default_headers,
                idempotency_header: self.idempotency_header,
                request_timeout: self.request_timeout.unwrap_or(Some(defaults.request_timeout)),
                retry_policy: self.retry_policy.unwrap_or(defaults.retry_policy),
                retry_policies: self.retry_policies,
                circuit_breaker_policy: self
                    .circuit_breaker_policy
                    .unwrap_or(defaults.circuit_breaker_policy),
                circuit_breaker_policies: self.circuit_breaker_policies,
                breakers: self.breakers.unwrap_or_default(),
                rate_limit_policy: self.rate_limit_policy.unwrap_or(defaults.rate_limit_policy),
                rate_limit_policies: self.rate_limit_policies,
                rate_limiter: self
                    .rate_limiter
                    .unwrap_or_else(|| Arc::new(BackoffRegistry::new())),
                byte_budget,
                await_options: self.await_options.unwrap_or(defaults.await_options),
                poll_classifier: self.poll_classifier,
                metrics,
            }),
        })
    }

    pub fn build(self) -> Client {
        self.try_build()
            .unwrap_or_else(|error| panic!("failed to build pristine client: {error}"))
    }
}

type Transports = (Arc<dyn Transport>, Option<Arc<dyn StreamingTransport>>);

#[cfg(feature = "hyper-transport")]
fn resolve_transports(
    transport: Option<Arc<dyn Transport>>,
    streaming_transport: Option<Arc<dyn StreamingTransport>>,
) -> crate::Result<Transports> {
    use crate::transport::HyperTransport;

    if let Some(transport) = transport {
        return Ok((transport, streaming_transport));
    }
    let hyper = Arc::new(HyperTransport::new()?);
    let transport: Arc<dyn Transport> = hyper.clone();
    let streaming_transport: Arc<dyn StreamingTransport> = match streaming_transport {
        Some(streaming_transport) => streaming_transport,
        None => hyper,
    };
    Ok((transport, Some(streaming_transport)))
}

#[cfg(not(feature = "hyper-transport"))]
fn resolve_transports(
    transport: Option<Arc<dyn Transport>>,
    streaming_transport: Option<Arc<dyn StreamingTransport>>,
) -> crate::Result<Transports> {
    let transport = transport.ok_or(Error::MissingTransport { kind: "request" })?;
    Ok((transport, streaming_transport))
}

/// Entry point for invoking endpoints. Cheap to clone; clones share breakers,
/// backoff windows and the byte budget.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<Context>,
}

impl Client {
    pub fn builder(base_url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Rate-limit key of this client's destination.
    pub fn destination(&self) -> &str {
        &self.inner.destination
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.inner.breakers
    }

    pub fn byte_budget(&self) -> Option<&Arc<ByteBudget>> {
        self.inner.byte_budget.as_ref()
    }

    pub fn metrics_snapshot(&self) -> Option<PipelineMetricsSnapshot> {
        self.inner.metrics.as_ref().map(|metrics| metrics.snapshot())
    }

    pub(crate) fn emit(&self, name: &str, measurements: &Measurements, metadata: &Metadata) {
        self.inner.telemetry.emit(name, measurements, metadata);
    }

    pub(crate) fn poll_classifier(&self) -> &dyn PollClassifier {
        self.inner.poll_classifier.as_ref()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("base_url", &self.inner.base_url)
            .field("request_timeout", &self.inner.request_timeout)
            .field("retry_policy", &self.inner.retry_policy)
            .field("telemetry", &self.inner.telemetry)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientBuilder")
            .field("base_url", &self.base_url)
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}
