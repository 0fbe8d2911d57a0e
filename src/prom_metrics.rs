//! # Prometheus Metrics: Exposition for Container Orchestration
//!
//! Exposes control-plane metrics in the OpenMetrics text format for scraping
//! by Prometheus, Grafana Agent, or any OpenMetrics-compatible collector.
//!
//! ## Metrics Exposed
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `fleetmeter_http_request_duration_seconds` | Histogram | `method`, `path` | API latency |
//! | `fleetmeter_reconcile_passes_total` | Counter | - | Worker reconciliation passes |
//! | `fleetmeter_workers_discovered_total` | Counter | - | Worker rows created from remote listings |
//! | `fleetmeter_workers_activated_total` | Counter | - | `pending → active` billing activations |
//! | `fleetmeter_workers_marked_offline_total` | Counter | - | Workers moved to OFFLINE |
//! | `fleetmeter_remote_errors_total` | Counter | `cluster` | Failed remote cluster calls |
//! | `fleetmeter_billing_cycles_total` | Counter | - | Metering cycles run |
//! | `fleetmeter_billing_charges_total` | Counter | - | Ledger rows written |
//! | `fleetmeter_billed_amount_micros_total` | Counter | - | Charged amount, micro-units |
//! | `fleetmeter_billed_seconds_total` | Counter | - | Charged worker seconds |
//! | `fleetmeter_billing_skips_total` | Counter | `reason` | Workers skipped in a cycle |
//! | `fleetmeter_workers_finalized_total` | Counter | - | Workers closed as `final_billed` |
//! | `fleetmeter_settlement_publish_failures_total` | Counter | - | Settlement messages not delivered |
//! | `fleetmeter_balance_check_failures_total` | Counter | - | Balance lookups that failed |
//! | `fleetmeter_forced_scale_downs_total` | Counter | - | Endpoints scaled to zero for negative balance |
//! | `fleetmeter_compensation_failures_total` | Counter | - | Dangling remote endpoints (alerting) |
//! | `fleetmeter_clusters_marked_offline_total` | Counter | - | Clusters flipped offline by the health sweep |
//!
//! `/metrics` renders the registry on each scrape.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct HttpLabel {
    pub method: String,
    pub path: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct ClusterLabel {
    pub cluster: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct ReasonLabel {
    pub reason: String,
}

type HistogramConstructor = fn() -> Histogram;

fn http_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.005, 2.0, 12))
}

/// Thread-safe metrics registry for the control plane.
///
/// All fields use atomic types and are safe to update from any task.
pub struct Metrics {
    pub registry: Registry,
    pub http_request_duration: Family<HttpLabel, Histogram, HistogramConstructor>,
    pub reconcile_passes: Counter,
    pub workers_discovered: Counter,
    pub workers_activated: Counter,
    pub workers_marked_offline: Counter,
    pub remote_errors: Family<ClusterLabel, Counter>,
    pub billing_cycles: Counter,
    pub billing_charges: Counter,
    pub billed_amount_micros: Counter,
    pub billed_seconds: Counter,
    pub billing_skips: Family<ReasonLabel, Counter>,
    pub workers_finalized: Counter,
    pub settlement_publish_failures: Counter,
    pub balance_check_failures: Counter,
    pub forced_scale_downs: Counter,
    pub compensation_failures: Counter,
    pub clusters_marked_offline: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let http_request_duration =
            Family::<HttpLabel, Histogram, HistogramConstructor>::new_with_constructor(
                http_histogram,
            );
        registry.register(
            "fleetmeter_http_request_duration_seconds",
            "HTTP request latency by method and normalized path",
            http_request_duration.clone(),
        );

        let reconcile_passes = Counter::default();
        registry.register(
            "fleetmeter_reconcile_passes",
            "Worker reconciliation passes",
            reconcile_passes.clone(),
        );

        let workers_discovered = Counter::default();
        registry.register(
            "fleetmeter_workers_discovered",
            "Worker rows created from remote listings",
            workers_discovered.clone(),
        );

        let workers_activated = Counter::default();
        registry.register(
            "fleetmeter_workers_activated",
            "Workers whose billing moved from pending to active",
            workers_activated.clone(),
        );

        let workers_marked_offline = Counter::default();
        registry.register(
            "fleetmeter_workers_marked_offline",
            "Workers marked OFFLINE by reconciliation",
            workers_marked_offline.clone(),
        );

        let remote_errors = Family::<ClusterLabel, Counter>::default();
        registry.register(
            "fleetmeter_remote_errors",
            "Failed remote cluster calls by cluster",
            remote_errors.clone(),
        );

        let billing_cycles = Counter::default();
        registry.register(
            "fleetmeter_billing_cycles",
            "Metering cycles run",
            billing_cycles.clone(),
        );

        let billing_charges = Counter::default();
        registry.register(
            "fleetmeter_billing_charges",
            "Ledger rows written",
            billing_charges.clone(),
        );

        let billed_amount_micros = Counter::default();
        registry.register(
            "fleetmeter_billed_amount_micros",
            "Charged amount in currency micro-units",
            billed_amount_micros.clone(),
        );

        let billed_seconds = Counter::default();
        registry.register(
            "fleetmeter_billed_seconds",
            "Charged worker seconds",
            billed_seconds.clone(),
        );

        let billing_skips = Family::<ReasonLabel, Counter>::default();
        registry.register(
            "fleetmeter_billing_skips",
            "Workers skipped in a metering cycle by reason",
            billing_skips.clone(),
        );

        let workers_finalized = Counter::default();
        registry.register(
            "fleetmeter_workers_finalized",
            "Workers closed as final_billed",
            workers_finalized.clone(),
        );

        let settlement_publish_failures = Counter::default();
        registry.register(
            "fleetmeter_settlement_publish_failures",
            "Settlement messages that could not be published",
            settlement_publish_failures.clone(),
        );

        let balance_check_failures = Counter::default();
        registry.register(
            "fleetmeter_balance_check_failures",
            "Balance lookups that failed",
            balance_check_failures.clone(),
        );

        let forced_scale_downs = Counter::default();
        registry.register(
            "fleetmeter_forced_scale_downs",
            "Endpoints scaled to zero because the tenant balance went negative",
            forced_scale_downs.clone(),
        );

        let compensation_failures = Counter::default();
        registry.register(
            "fleetmeter_compensation_failures",
            "Compensating remote deletes that failed, leaving a dangling endpoint",
            compensation_failures.clone(),
        );

        let clusters_marked_offline = Counter::default();
        registry.register(
            "fleetmeter_clusters_marked_offline",
            "Clusters flipped offline by the health sweep",
            clusters_marked_offline.clone(),
        );

        Self {
            registry,
            http_request_duration,
            reconcile_passes,
            workers_discovered,
            workers_activated,
            workers_marked_offline,
            remote_errors,
            billing_cycles,
            billing_charges,
            billed_amount_micros,
            billed_seconds,
            billing_skips,
            workers_finalized,
            settlement_publish_failures,
            balance_check_failures,
            forced_scale_downs,
            compensation_failures,
            clusters_marked_offline,
        }
    }

    pub fn remote_error(&self, cluster_id: &str) {
        self.remote_errors
            .get_or_create(&ClusterLabel {
                cluster: cluster_id.to_string(),
            })
            .inc();
    }

    pub fn billing_skip(&self, reason: &str) {
        self.billing_skips
            .get_or_create(&ReasonLabel {
                reason: reason.to_string(),
            })
            .inc();
    }

    /// Render all metrics in OpenMetrics text format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        if let Err(e) = encode(&mut buf, &self.registry) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
