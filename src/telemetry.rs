//! Pluggable, fire-and-forget telemetry.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, warn};

pub type Measurements = BTreeMap<&'static str, f64>;
pub type Metadata = BTreeMap<&'static str, String>;

/// Event names emitted by the pipeline and the poller.
pub mod events {
    pub const REQUEST_START: &str = "request.start";
    pub const REQUEST_STOP: &str = "request.stop";
    pub const REQUEST_EXCEPTION: &str = "request.exception";
    pub const REQUEST_RETRY: &str = "request.retry";
    pub const RATE_LIMIT_BACKOFF: &str = "rate_limit.backoff";
    pub const CIRCUIT_REJECTED: &str = "circuit.rejected";
    pub const FUTURE_POLL: &str = "future.poll";
    pub const FUTURE_QUEUE_STATE: &str = "future.queue_state";
    pub const FUTURE_RESOLVED: &str = "future.resolved";
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, name: &str, measurements: &Measurements, metadata: &Metadata);
}

/// Writes telemetry as `tracing` events under the `pristine::telemetry` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn emit(&self, name: &str, measurements: &Measurements, metadata: &Metadata) {
        debug!(
            target: "pristine::telemetry",
            event = name,
            ?measurements,
            ?metadata,
            "telemetry"
        );
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn emit(&self, _name: &str, _measurements: &Measurements, _metadata: &Metadata) {}
}

/// The client's configured sinks. A panicking sink is logged and skipped so
/// telemetry can never fail a call.
#[derive(Clone, Default)]
pub(crate) struct Telemetry {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl Telemetry {
    pub(crate) fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }

    pub(crate) fn emit(&self, name: &str, measurements: &Measurements, metadata: &Metadata) {
        for sink in &self.sinks {
            let emitted = catch_unwind(AssertUnwindSafe(|| sink.emit(name, measurements, metadata)));
            if emitted.is_err() {
                warn!(event = name, "telemetry sink panicked; event dropped");
            }
        }
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Telemetry")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
