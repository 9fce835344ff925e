use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::telemetry::{Measurements, Metadata, TelemetrySink, events};
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineMetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub retries: u64,
    pub rate_limit_backoffs: u64,
    pub circuit_rejections: u64,
    pub polls: u64,
    pub futures_resolved: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

/// Telemetry sink that aggregates pipeline events into counters.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    retries: AtomicU64,
    rate_limit_backoffs: AtomicU64,
    circuit_rejections: AtomicU64,
    polls: AtomicU64,
    futures_resolved: AtomicU64,
    latency_samples: AtomicU64,
    latency_total_ms: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        let latency_samples = self.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = self.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };
        PipelineMetricsSnapshot {
            requests_started: self.requests_started.load(Ordering::Relaxed),
            requests_succeeded: self.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            rate_limit_backoffs: self.rate_limit_backoffs.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            futures_resolved: self.futures_resolved.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&self.status_counts).clone(),
            error_counts: lock_unpoisoned(&self.error_counts).clone(),
        }
    }

    fn record_latency(&self, measurements: &Measurements) {
        let Some(duration_ms) = measurements.get("duration_ms") else {
            return;
        };
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
        self.latency_total_ms
            .fetch_add(duration_ms.max(0.0).round() as u64, Ordering::Relaxed);
    }

    fn add_status_count(&self, metadata: &Metadata) {
        let Some(status) = metadata.get("status").and_then(|status| status.parse::<u16>().ok())
        else {
            return;
        };
        *lock_unpoisoned(&self.status_counts).entry(status).or_insert(0) += 1;
    }

    fn add_error_count(&self, metadata: &Metadata) {
        let category = metadata
            .get("category")
            .map(String::as_str)
            .unwrap_or("unknown");
        *lock_unpoisoned(&self.error_counts)
            .entry(category.to_owned())
            .or_insert(0) += 1;
    }
}

impl TelemetrySink for PipelineMetrics {
    fn emit(&self, name: &str, measurements: &Measurements, metadata: &Metadata) {
        match name {
            events::REQUEST_START => {
                self.requests_started.fetch_add(1, Ordering::Relaxed);
            }
            events::REQUEST_STOP => {
                self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
                self.record_latency(measurements);
                self.add_status_count(metadata);
            }
            events::REQUEST_EXCEPTION => {
                self.requests_failed.fetch_add(1, Ordering::Relaxed);
                self.record_latency(measurements);
                self.add_status_count(metadata);
                self.add_error_count(metadata);
            }
            events::REQUEST_RETRY => {
                self.retries.fetch_add(1, Ordering::Relaxed);
            }
            events::RATE_LIMIT_BACKOFF => {
                self.rate_limit_backoffs.fetch_add(1, Ordering::Relaxed);
            }
            events::CIRCUIT_REJECTED => {
                self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
            }
            events::FUTURE_POLL => {
                self.polls.fetch_add(1, Ordering::Relaxed);
            }
            events::FUTURE_RESOLVED => {
                self.futures_resolved.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}
