use crate::telemetry::{runtime_counters, RuntimeCounters};
use std::sync::OnceLock;

pub use crate::telemetry::RuntimeCountersSnapshot;

/// Collector that wraps the runtime counter APIs with a single entrypoint.
pub struct MetricsCollector {
    counters: &'static RuntimeCounters,
}

impl MetricsCollector {
    fn new() -> Self {
        Self {
            counters: runtime_counters(),
        }
    }

    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
        INSTANCE.get_or_init(Self::new)
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        self.counters.snapshot()
    }

    pub fn record_payload(&self) {
        self.counters.inc_payloads_received();
    }

    pub fn record_empty_poll(&self) {
        self.counters.inc_polls_empty();
    }

    pub fn record_connect_failure(&self) {
        self.counters.inc_connect_failures();
    }

    pub fn record_transport_error(&self) {
        self.counters.inc_transport_errors();
    }

    pub fn record_offline_record(&self) {
        self.counters.inc_offline_records();
    }

    pub fn record_resolution_skipped(&self) {
        self.counters.inc_resolutions_skipped();
    }

    pub fn record_store_failure(&self) {
        self.counters.inc_store_failures();
    }
}

pub fn metrics() -> &'static MetricsCollector {
    MetricsCollector::global()
}
