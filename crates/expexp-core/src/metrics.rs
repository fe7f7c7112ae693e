//! Counters describing the proxy's own behaviour.
//!
//! A single `ProxyMetrics` is built at startup and shared via `Arc`. Its
//! registry is served on the proxy's telemetry endpoint.

use prometheus::core::Collector;
use prometheus::{IntCounterVec, Opts, Registry};

/// Label every proxy counter is keyed by.
pub const MODULE_LABEL: &str = "module";

pub struct ProxyMetrics {
    registry: Registry,
    file_starts: IntCounterVec,
    file_fails: IntCounterVec,
    timeouts: IntCounterVec,
    malformed: IntCounterVec,
}

impl ProxyMetrics {
    /// Creates the counters and registers them in a fresh registry.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let file_starts = register(
            &registry,
            "expexp_file_starts_total",
            "Count of file module fetches started",
        )?;
        let file_fails = register(
            &registry,
            "expexp_file_fails_total",
            "Count of file module fetches that failed to read the file",
        )?;
        let timeouts = register(
            &registry,
            "expexp_proxy_timeout_total",
            "Count of proxied fetches that ran past their deadline",
        )?;
        let malformed = register(
            &registry,
            "expexp_proxy_malformed_total",
            "Count of proxied responses that could not be parsed",
        )?;

        Ok(Self {
            registry,
            file_starts,
            file_fails,
            timeouts,
            malformed,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_start(&self, module: &str) {
        self.file_starts.with_label_values(&[module]).inc();
    }

    pub fn record_failure(&self, module: &str) {
        self.file_fails.with_label_values(&[module]).inc();
    }

    pub fn record_timeout(&self, module: &str) {
        self.timeouts.with_label_values(&[module]).inc();
    }

    pub fn record_malformed(&self, module: &str) {
        self.malformed.with_label_values(&[module]).inc();
    }

    pub fn starts(&self, module: &str) -> u64 {
        current(&self.file_starts, module)
    }

    pub fn failures(&self, module: &str) -> u64 {
        current(&self.file_fails, module)
    }

    pub fn timeouts(&self, module: &str) -> u64 {
        current(&self.timeouts, module)
    }

    pub fn malformed(&self, module: &str) -> u64 {
        current(&self.malformed, module)
    }
}

/// Reads a counter without creating its series.
fn current(counter: &IntCounterVec, module: &str) -> u64 {
    counter
        .collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .find(|metric| {
            metric
                .get_label()
                .iter()
                .any(|l| l.get_name() == MODULE_LABEL && l.get_value() == module)
        })
        .map_or(0, |metric| metric.get_counter().get_value() as u64)
}

fn register(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), &[MODULE_LABEL])?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}
