//! Prometheus metrics for one nanny process.
//!
//! Every metric name carries the nanny identity as its namespace, e.g.
//! `volume_nanny_faults_seen_total{kind="A1_STORAGE_ATTACHED_COMPUTE_MISSING"}`.

use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

pub struct NannyMetrics {
    registry: Registry,
    pub cycles: IntCounter,
    pub cycle_failures: IntCounter,
    pub faults_seen: IntCounterVec,
    pub candidates_promoted: IntCounterVec,
    pub repairs_attempted: IntCounterVec,
    pub repairs_failed: IntCounterVec,
    pub dry_run_actions: IntCounterVec,
    pub dry_run_forced_cycles: IntCounter,
    pub manual_checks: IntCounterVec,
    pub upstream_unavailable: IntCounterVec,
    pub category_cap_tripped: IntGaugeVec,
    pub pending_faults: IntGauge,
    pub datastore_usage: GaugeVec,
    pub aggregate_usage: GaugeVec,
    pub balancer_proposals: IntGaugeVec,
}

/// Metric namespaces may only contain `[a-zA-Z0-9_]`.
pub fn sanitize_namespace(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(true) {
        out.insert(0, '_');
    }
    out
}

impl NannyMetrics {
    pub fn new(prefix: &str) -> Result<Self, prometheus::Error> {
        let ns = sanitize_namespace(prefix);
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::with_opts(Opts::new(name, help).namespace(ns.clone()))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let counter_vec =
            |name: &str, help: &str, label: &str| -> Result<IntCounterVec, prometheus::Error> {
                let c = IntCounterVec::new(Opts::new(name, help).namespace(ns.clone()), &[label])?;
                registry.register(Box::new(c.clone()))?;
                Ok(c)
            };
        let int_gauge_vec =
            |name: &str, help: &str, label: &str| -> Result<IntGaugeVec, prometheus::Error> {
                let g = IntGaugeVec::new(Opts::new(name, help).namespace(ns.clone()), &[label])?;
                registry.register(Box::new(g.clone()))?;
                Ok(g)
            };
        let gauge_vec =
            |name: &str, help: &str, label: &str| -> Result<GaugeVec, prometheus::Error> {
                let g = GaugeVec::new(Opts::new(name, help).namespace(ns.clone()), &[label])?;
                registry.register(Box::new(g.clone()))?;
                Ok(g)
            };

        let pending_faults = IntGauge::with_opts(
            Opts::new("pending_faults", "Faults seen but below the persistence threshold")
                .namespace(ns.clone()),
        )?;
        registry.register(Box::new(pending_faults.clone()))?;

        Ok(Self {
            cycles: counter("cycles_total", "Completed cycles")?,
            cycle_failures: counter("cycle_failures_total", "Cycles aborted by an error")?,
            faults_seen: counter_vec("faults_seen_total", "Faults classified", "kind")?,
            candidates_promoted: counter_vec(
                "candidates_promoted_total",
                "Faults promoted past the persistence filter",
                "kind",
            )?,
            repairs_attempted: counter_vec(
                "repairs_attempted_total",
                "Repairs executed against an upstream",
                "kind",
            )?,
            repairs_failed: counter_vec("repairs_failed_total", "Repairs that failed", "kind")?,
            dry_run_actions: counter_vec(
                "dry_run_actions_total",
                "Actions skipped because of dry-run",
                "kind",
            )?,
            dry_run_forced_cycles: counter(
                "dry_run_forced_cycles_total",
                "Cycles forced into dry-run by a structural anomaly",
            )?,
            manual_checks: counter_vec(
                "manual_check_total",
                "Conditions that need an operator",
                "kind",
            )?,
            upstream_unavailable: counter_vec(
                "upstream_unavailable_total",
                "Snapshot fetches that failed",
                "upstream",
            )?,
            category_cap_tripped: int_gauge_vec(
                "category_cap_tripped",
                "1 when the candidates of a kind exceeded its cap this cycle",
                "kind",
            )?,
            pending_faults,
            datastore_usage: gauge_vec("datastore_usage_percent", "Datastore usage", "datastore")?,
            aggregate_usage: gauge_vec("aggregate_usage_percent", "Aggregate usage", "aggregate")?,
            balancer_proposals: int_gauge_vec(
                "balancer_proposals",
                "Balancer proposals of the last cycle per decision class",
                "decision",
            )?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format for the `/metrics` endpoint.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            tracing::error!("failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
