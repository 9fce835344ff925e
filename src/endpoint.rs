//! Endpoint descriptors: one immutable value per remote operation, built once
//! (by hand or from an already-validated JSON manifest) and shared read-only.

use std::collections::BTreeMap;

use http::Method;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// How the request payload is put on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyKind {
    #[default]
    Json,
    Raw,
    Multipart,
}

impl BodyKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Raw => "raw",
            Self::Multipart => "multipart",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    id: String,
    #[serde(with = "method_name")]
    method: Method,
    path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response_type: Option<String>,
    #[serde(default)]
    streaming: bool,
    #[serde(default, rename = "async")]
    asynchronous: bool,
    #[serde(default)]
    idempotent: bool,
    #[serde(default)]
    body_kind: BodyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    circuit_breaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rate_limit: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    poll: Option<Box<Endpoint>>,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method,
            path: path.into(),
            request_type: None,
            response_type: None,
            streaming: false,
            asynchronous: false,
            idempotent: false,
            body_kind: BodyKind::Json,
            retry: None,
            circuit_breaker: None,
            rate_limit: None,
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            poll: None,
        }
    }

    pub fn get(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(id, Method::GET, path)
    }

    pub fn post(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(id, Method::POST, path)
    }

    /// Parses one endpoint from a manifest fragment.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let endpoint: Self = serde_json::from_str(json).map_err(|source| Error::InvalidEndpoint {
            message: source.to_string(),
        })?;
        endpoint.check()?;
        Ok(endpoint)
    }

    /// Parses a JSON array of endpoints.
    pub fn list_from_json(json: &str) -> Result<Vec<Self>, Error> {
        let endpoints: Vec<Self> =
            serde_json::from_str(json).map_err(|source| Error::InvalidEndpoint {
                message: source.to_string(),
            })?;
        for endpoint in &endpoints {
            endpoint.check()?;
        }
        Ok(endpoints)
    }

    fn check(&self) -> Result<(), Error> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidEndpoint {
                message: "endpoint id must not be empty".to_owned(),
            });
        }
        if self.streaming && self.asynchronous {
            return Err(Error::InvalidEndpoint {
                message: format!("endpoint {} cannot be both streaming and async", self.id),
            });
        }
        if let Some(poll) = &self.poll {
            poll.check()?;
        }
        Ok(())
    }

    pub fn request_type(mut self, type_ref: impl Into<String>) -> Self {
        self.request_type = Some(type_ref.into());
        self
    }

    pub fn response_type(mut self, type_ref: impl Into<String>) -> Self {
        self.response_type = Some(type_ref.into());
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn body_kind(mut self, body_kind: BodyKind) -> Self {
        self.body_kind = body_kind;
        self
    }

    pub fn retry_policy(mut self, name: impl Into<String>) -> Self {
        self.retry = Some(name.into());
        self
    }

    pub fn circuit_breaker_policy(mut self, name: impl Into<String>) -> Self {
        self.circuit_breaker = Some(name.into());
        self
    }

    pub fn rate_limit_policy(mut self, name: impl Into<String>) -> Self {
        self.rate_limit = Some(name.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Endpoint polled for the status of jobs this async endpoint starts.
    pub fn poll_endpoint(mut self, poll: Endpoint) -> Self {
        self.poll = Some(Box::new(poll));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn request_type_ref(&self) -> Option<&str> {
        self.request_type.as_deref()
    }

    pub fn response_type_ref(&self) -> Option<&str> {
        self.response_type.as_deref()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn is_async(&self) -> bool {
        self.asynchronous
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn configured_body_kind(&self) -> BodyKind {
        self.body_kind
    }

    pub fn retry_policy_name(&self) -> Option<&str> {
        self.retry.as_deref()
    }

    pub fn circuit_breaker_policy_name(&self) -> Option<&str> {
        self.circuit_breaker.as_deref()
    }

    pub fn rate_limit_policy_name(&self) -> Option<&str> {
        self.rate_limit.as_deref()
    }

    pub fn default_headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn default_query(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    pub fn poll(&self) -> Option<&Endpoint> {
        self.poll.as_deref()
    }

    /// Breaker key for this endpoint: its policy name or, failing that, its id.
    pub(crate) fn breaker_key(&self) -> &str {
        self.circuit_breaker.as_deref().unwrap_or(&self.id)
    }
}

mod method_name {
    use http::Method;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(method: &Method, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(method.as_str())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Method, D::Error> {
        let name = String::deserialize(deserializer)?;
        Method::from_bytes(name.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| D::Error::custom(format!("invalid http method `{name}`")))
    }
}
