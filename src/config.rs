use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::future::AwaitOptions;
use crate::rate_limit::RateLimitPolicy;
use crate::retry::RetryPolicy;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientProfile {
    #[default]
    StandardSdk,
    LowLatency,
    HighThroughput,
}

#[derive(Clone, Debug)]
pub struct ProfileDefaults {
    pub request_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub circuit_breaker_policy: CircuitBreakerPolicy,
    pub rate_limit_policy: RateLimitPolicy,
    pub await_options: AwaitOptions,
    pub max_in_flight_bytes: Option<u64>,
}

impl ClientProfile {
    pub fn defaults(self) -> ProfileDefaults {
        match self {
            Self::StandardSdk => ProfileDefaults {
                request_timeout: Duration::from_secs(30),
                retry_policy: RetryPolicy::standard(),
                circuit_breaker_policy: CircuitBreakerPolicy::standard(),
                rate_limit_policy: RateLimitPolicy::standard(),
                await_options: AwaitOptions::standard(),
                max_in_flight_bytes: None,
            },
            Self::LowLatency => ProfileDefaults {
                request_timeout: Duration::from_secs(5),
                retry_policy: RetryPolicy::standard()
                    .max_attempts(2)
                    .base_backoff(Duration::from_millis(50))
                    .max_backoff(Duration::from_millis(300)),
                circuit_breaker_policy: CircuitBreakerPolicy::standard()
                    .failure_threshold(3)
                    .reset_timeout(Duration::from_secs(10)),
                rate_limit_policy: RateLimitPolicy::standard()
                    .default_backoff(Duration::from_millis(250))
                    .max_backoff(Duration::from_secs(5)),
                await_options: AwaitOptions::standard()
                    .poll_interval(Duration::from_millis(100))
                    .max_poll_interval(Duration::from_secs(2)),
                max_in_flight_bytes: None,
            },
            Self::HighThroughput => ProfileDefaults {
                request_timeout: Duration::from_secs(120),
                retry_policy: RetryPolicy::standard()
                    .max_attempts(5)
                    .base_backoff(Duration::from_millis(250))
                    .max_backoff(Duration::from_secs(8)),
                circuit_breaker_policy: CircuitBreakerPolicy::standard()
                    .failure_threshold(10)
                    .half_open_max_calls(2),
                rate_limit_policy: RateLimitPolicy::standard(),
                await_options: AwaitOptions::standard()
                    .poll_interval(Duration::from_secs(1))
                    .max_poll_interval(Duration::from_secs(60)),
                max_in_flight_bytes: Some(64 * 1024 * 1024),
            },
        }
    }
}
