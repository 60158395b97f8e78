//! Metrics collector using prometheus-client.
//!
//! Covers call outcomes and latency, retries, per-server in-flight calls,
//! health and selections.

use crate::registry::HealthStatus;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;

/// Labels for call outcome metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CallLabels {
    pub method: String,
    pub result: CallResult,
}

/// Final outcome of a balanced call.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CallResult {
    Success,
    Failure,
}

/// Labels keyed only by RPC method.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MethodLabels {
    pub method: String,
}

/// Labels keyed only by server id.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServerLabels {
    pub server: String,
}

/// Labels for health check metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthCheckLabels {
    pub server: String,
    pub result: HealthCheckResult,
}

/// Result of a health check.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HealthCheckResult {
    Success,
    Failure,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Finished calls by method and outcome.
    calls_total: Family<CallLabels, Counter>,
    /// End-to-end call duration, retries included (in seconds).
    call_duration_seconds: Family<MethodLabels, Histogram>,
    /// Retried attempts by method.
    retries_total: Family<MethodLabels, Counter>,
    /// Calls in flight per server.
    server_connections: Family<ServerLabels, Gauge>,
    /// Server health (1 = healthy, 0 = unhealthy, -1 = unknown).
    server_health: Family<ServerLabels, Gauge>,
    /// Health probe results.
    health_checks_total: Family<HealthCheckLabels, Counter>,
    /// Times each server was picked.
    selections_total: Family<ServerLabels, Counter>,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let calls_total = Family::<CallLabels, Counter>::default();
        let call_duration_seconds = Family::<MethodLabels, Histogram>::new_with_constructor(|| {
            // 1ms up to roughly 16s
            Histogram::new(exponential_buckets(0.001, 2.0, 15))
        });
        let retries_total = Family::<MethodLabels, Counter>::default();
        let server_connections = Family::<ServerLabels, Gauge>::default();
        let server_health = Family::<ServerLabels, Gauge>::default();
        let health_checks_total = Family::<HealthCheckLabels, Counter>::default();
        let selections_total = Family::<ServerLabels, Counter>::default();

        registry.register(
            "rpclb_calls",
            "Total number of balanced calls",
            calls_total.clone(),
        );
        registry.register(
            "rpclb_call_duration_seconds",
            "Balanced call duration in seconds, retries included",
            call_duration_seconds.clone(),
        );
        registry.register(
            "rpclb_retries",
            "Total number of retried attempts",
            retries_total.clone(),
        );
        registry.register(
            "rpclb_server_connections",
            "Calls currently in flight per server",
            server_connections.clone(),
        );
        registry.register(
            "rpclb_server_health",
            "Server health status (1=healthy, 0=unhealthy, -1=unknown)",
            server_health.clone(),
        );
        registry.register(
            "rpclb_health_checks",
            "Total number of health probes performed",
            health_checks_total.clone(),
        );
        registry.register(
            "rpclb_selections",
            "Total number of times a server was selected",
            selections_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                calls_total,
                call_duration_seconds,
                retries_total,
                server_connections,
                server_health,
                health_checks_total,
                selections_total,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Record a finished call.
    pub fn record_call(&self, method: &str, success: bool, duration: Duration) {
        let labels = CallLabels {
            method: method.to_string(),
            result: if success {
                CallResult::Success
            } else {
                CallResult::Failure
            },
        };
        self.inner.calls_total.get_or_create(&labels).inc();
        self.inner
            .call_duration_seconds
            .get_or_create(&method_labels(method))
            .observe(duration.as_secs_f64());
    }

    /// Record that an attempt of `method` is being retried.
    pub fn record_retry(&self, method: &str) {
        self.inner
            .retries_total
            .get_or_create(&method_labels(method))
            .inc();
    }

    pub fn set_server_connections(&self, server: &str, count: u64) {
        self.inner
            .server_connections
            .get_or_create(&server_labels(server))
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn set_server_health(&self, server: &str, status: HealthStatus) {
        let value = match status {
            HealthStatus::Healthy => 1,
            HealthStatus::Unhealthy => 0,
            HealthStatus::Unknown => -1,
        };
        self.inner
            .server_health
            .get_or_create(&server_labels(server))
            .set(value);
    }

    /// Record a health probe result.
    pub fn record_health_check(&self, server: &str, success: bool) {
        let labels = HealthCheckLabels {
            server: server.to_string(),
            result: if success {
                HealthCheckResult::Success
            } else {
                HealthCheckResult::Failure
            },
        };
        self.inner.health_checks_total.get_or_create(&labels).inc();
    }

    pub fn record_selection(&self, server: &str) {
        self.inner
            .selections_total
            .get_or_create(&server_labels(server))
            .inc();
    }

    /// Drop the per-server gauges of a removed server.
    ///
    /// Counters are kept so totals stay monotonic.
    pub fn remove_server(&self, server: &str) {
        let labels = server_labels(server);
        self.inner.server_connections.remove(&labels);
        self.inner.server_health.remove(&labels);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn method_labels(method: &str) -> MethodLabels {
    MethodLabels {
        method: method.to_string(),
    }
}

fn server_labels(server: &str) -> ServerLabels {
    ServerLabels {
        server: server.to_string(),
    }
}
