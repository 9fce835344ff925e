use std::time::Duration;

use http::{Method, StatusCode};
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse failure class used by callers to decide what to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCategory {
    Validation,
    Authentication,
    PermissionDenied,
    NotFound,
    Conflict,
    RateLimit,
    RequestTimeout,
    ServerError,
    Connection,
    CircuitOpen,
    BudgetTimeout,
    FutureTimeout,
    FutureFailed,
    Configuration,
    Internal,
}

impl ErrorCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Authentication => "authentication",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::RateLimit => "rate_limit",
            Self::RequestTimeout => "request_timeout",
            Self::ServerError => "server_error",
            Self::Connection => "connection",
            Self::CircuitOpen => "circuit_open",
            Self::BudgetTimeout => "budget_timeout",
            Self::FutureTimeout => "future_timeout",
            Self::FutureFailed => "future_failed",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        }
    }

    /// Maps a non-success HTTP status onto the taxonomy.
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            401 => Self::Authentication,
            403 => Self::PermissionDenied,
            404 => Self::NotFound,
            408 => Self::RequestTimeout,
            409 => Self::Conflict,
            429 => Self::RateLimit,
            500..=599 => Self::ServerError,
            _ => Self::Validation,
        }
    }

    /// Whether a failure of this class is a candidate for another attempt.
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::RequestTimeout | Self::ServerError | Self::Connection
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    MissingPathParam,
    InvalidHeaderName,
    InvalidHeaderValue,
    Encode,
    Decode,
    HttpStatus,
    Connection,
    Timeout,
    ReadBody,
    CircuitOpen,
    BudgetTimeout,
    FutureTimeout,
    FutureFailed,
    MissingRequestId,
    MissingPollEndpoint,
    UnknownPolicy,
    InvalidEndpoint,
    TlsBackendInit,
    MissingTransport,
    Internal,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::MissingPathParam => "missing_path_param",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::Encode => "encode",
            Self::Decode => "decode",
            Self::HttpStatus => "http_status",
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::ReadBody => "read_body",
            Self::CircuitOpen => "circuit_open",
            Self::BudgetTimeout => "budget_timeout",
            Self::FutureTimeout => "future_timeout",
            Self::FutureFailed => "future_failed",
            Self::MissingRequestId => "missing_request_id",
            Self::MissingPollEndpoint => "missing_poll_endpoint",
            Self::UnknownPolicy => "unknown_policy",
            Self::InvalidEndpoint => "invalid_endpoint",
            Self::TlsBackendInit => "tls_backend_init",
            Self::MissingTransport => "missing_transport",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("endpoint {endpoint} is missing path parameter `{name}`")]
    MissingPathParam { endpoint: String, name: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to encode request payload for {endpoint}: {message}")]
    Encode { endpoint: String, message: String },
    #[error("failed to decode response for {endpoint}: {message}; body={body}")]
    Decode {
        endpoint: String,
        message: String,
        body: String,
    },
    #[error("http status error {status} ({category}) for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        category: ErrorCategory,
        method: Method,
        uri: String,
        retry_after: Option<Duration>,
        body: String,
    },
    #[error("connection error for {method} {uri}: {source}")]
    Connection {
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: BoxError,
    },
    #[error("circuit breaker {name} is open; retry after {retry_after_ms}ms")]
    CircuitOpen { name: String, retry_after_ms: u128 },
    #[error("timed out after {timeout_ms}ms waiting for {bytes} bytes of in-flight budget")]
    BudgetTimeout { bytes: u64, timeout_ms: u128 },
    #[error("future {request_id} did not resolve within {elapsed_ms}ms ({polls} polls)")]
    FutureTimeout {
        request_id: String,
        elapsed_ms: u128,
        polls: u32,
    },
    #[error("future {request_id} failed: {payload}")]
    FutureFailed {
        request_id: String,
        payload: serde_json::Value,
    },
    #[error("async acknowledgement from {endpoint} carries no request id")]
    MissingRequestId { endpoint: String },
    #[error("async endpoint {endpoint} has no poll endpoint configured")]
    MissingPollEndpoint { endpoint: String },
    #[error("unknown {kind} policy `{name}`")]
    UnknownPolicy { kind: &'static str, name: String },
    #[error("invalid endpoint definition: {message}")]
    InvalidEndpoint { message: String },
    #[error("failed to initialize tls backend: {message}")]
    TlsBackendInit { message: String },
    #[error("no {kind} transport configured")]
    MissingTransport { kind: &'static str },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::MissingPathParam { .. } => ErrorCode::MissingPathParam,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Encode { .. } => ErrorCode::Encode,
            Self::Decode { .. } => ErrorCode::Decode,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Connection { .. } => ErrorCode::Connection,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Self::BudgetTimeout { .. } => ErrorCode::BudgetTimeout,
            Self::FutureTimeout { .. } => ErrorCode::FutureTimeout,
            Self::FutureFailed { .. } => ErrorCode::FutureFailed,
            Self::MissingRequestId { .. } => ErrorCode::MissingRequestId,
            Self::MissingPollEndpoint { .. } => ErrorCode::MissingPollEndpoint,
            Self::UnknownPolicy { .. } => ErrorCode::UnknownPolicy,
            Self::InvalidEndpoint { .. } => ErrorCode::InvalidEndpoint,
            Self::TlsBackendInit { .. } => ErrorCode::TlsBackendInit,
            Self::MissingTransport { .. } => ErrorCode::MissingTransport,
            Self::Internal { .. } => ErrorCode::Internal,
        }
    }

    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::HttpStatus { category, .. } => *category,
            Self::Connection { .. } | Self::ReadBody { .. } => ErrorCategory::Connection,
            Self::Timeout { .. } => ErrorCategory::RequestTimeout,
            Self::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            Self::BudgetTimeout { .. } => ErrorCategory::BudgetTimeout,
            Self::FutureTimeout { .. } => ErrorCategory::FutureTimeout,
            Self::FutureFailed { .. } => ErrorCategory::FutureFailed,
            Self::InvalidUri { .. }
            | Self::MissingPathParam { .. }
            | Self::InvalidHeaderName { .. }
            | Self::InvalidHeaderValue { .. }
            | Self::Encode { .. }
            | Self::Decode { .. }
            | Self::MissingRequestId { .. } => ErrorCategory::Validation,
            Self::MissingPollEndpoint { .. }
            | Self::UnknownPolicy { .. }
            | Self::InvalidEndpoint { .. }
            | Self::TlsBackendInit { .. }
            | Self::MissingTransport { .. } => ErrorCategory::Configuration,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status).ok(),
            _ => None,
        }
    }

    /// Server or breaker supplied hint for when the call may succeed again.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::HttpStatus { retry_after, .. } => *retry_after,
            Self::CircuitOpen { retry_after_ms, .. } => Some(Duration::from_millis(
                (*retry_after_ms).min(u64::MAX as u128) as u64,
            )),
            _ => None,
        }
    }

    pub const fn is_retryable(&self) -> bool {
        self.category().is_transient()
    }
}
