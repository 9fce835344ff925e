use http::HeaderMap;
use http::header::{AUTHORIZATION, HeaderName, HeaderValue};

use crate::error::Error;
use crate::request::CallOptions;
use crate::util::{parse_header_name, parse_header_value};

/// Supplies authentication headers; providers are applied in the order they
/// were configured, later ones overriding earlier ones.
pub trait AuthProvider: Send + Sync {
    fn headers(&self, options: &CallOptions) -> Result<HeaderMap, Error>;

    /// Secret identifying the caller, used only to key shared rate-limit state.
    fn credential(&self) -> Option<&str> {
        None
    }
}

#[derive(Clone)]
pub struct BearerAuth {
    token: String,
    header: HeaderValue,
}

impl BearerAuth {
    pub fn new(token: impl Into<String>) -> Result<Self, Error> {
        let token = token.into();
        let mut header = parse_header_value(AUTHORIZATION.as_str(), &format!("Bearer {token}"))?;
        header.set_sensitive(true);
        Ok(Self { token, header })
    }
}

impl std::fmt::Debug for BearerAuth {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("BearerAuth").finish_non_exhaustive()
    }
}

impl AuthProvider for BearerAuth {
    fn headers(&self, _options: &CallOptions) -> Result<HeaderMap, Error> {
        let mut headers = HeaderMap::with_capacity(1);
        headers.insert(AUTHORIZATION, self.header.clone());
        Ok(headers)
    }

    fn credential(&self) -> Option<&str> {
        Some(&self.token)
    }
}

/// API key sent verbatim in a named header such as `x-api-key`.
#[derive(Clone)]
pub struct ApiKeyAuth {
    key: String,
    name: HeaderName,
    value: HeaderValue,
}

impl ApiKeyAuth {
    pub fn new(header_name: &str, key: impl Into<String>) -> Result<Self, Error> {
        let key = key.into();
        let name = parse_header_name(header_name)?;
        let mut value = parse_header_value(name.as_str(), &key)?;
        value.set_sensitive(true);
        Ok(Self { key, name, value })
    }
}

impl std::fmt::Debug for ApiKeyAuth {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ApiKeyAuth")
            .field("header", &self.name)
            .finish_non_exhaustive()
    }
}

impl AuthProvider for ApiKeyAuth {
    fn headers(&self, _options: &CallOptions) -> Result<HeaderMap, Error> {
        let mut headers = HeaderMap::with_capacity(1);
        headers.insert(self.name.clone(), self.value.clone());
        Ok(headers)
    }

    fn credential(&self) -> Option<&str> {
        Some(&self.key)
    }
}
