use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};

use crate::future::AwaitOptions;
use crate::util::{parse_header_name, parse_header_value};

/// A fully built request. Every retry attempt of one call sends this same value.
#[derive(Clone, Debug)]
pub struct Request {
    endpoint_id: String,
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Bytes,
    timeout: Option<Duration>,
}

impl Request {
    pub fn new(endpoint_id: impl Into<String>, method: Method, url: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timeout: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Per-attempt transport timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Per-call knobs layered over the endpoint and client defaults.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    pub(crate) path_params: BTreeMap<String, String>,
    pub(crate) query_pairs: Vec<(String, String)>,
    pub(crate) headers: HeaderMap,
    pub(crate) idempotency_key: Option<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) budget_timeout: Option<Duration>,
    pub(crate) await_options: Option<AwaitOptions>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.path_params.insert(name.into(), value.into());
        self
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    /// Reuses the caller's key instead of generating one for idempotent endpoints.
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// How long to queue for in-flight byte budget before failing.
    pub fn budget_timeout(mut self, timeout: Duration) -> Self {
        self.budget_timeout = Some(timeout);
        self
    }

    /// Poll settings for futures returned by this call.
    pub fn await_options(mut self, options: AwaitOptions) -> Self {
        self.await_options = Some(options);
        self
    }

    pub fn path_params(&self) -> &BTreeMap<String, String> {
        &self.path_params
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn configured_idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }
}
