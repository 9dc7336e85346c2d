//! Prometheus metrics for the controller.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Controller metrics, registered on a private registry served at `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconcile_total: IntCounterVec,
    reconcile_errors_total: IntCounterVec,
    reconcile_duration: Histogram,
    driver_calls_total: IntCounterVec,
    queue_depth: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new("vm_controller_reconcile_total", "Reconciliation passes by outcome"),
            &["outcome"],
        )?;
        let reconcile_errors_total = IntCounterVec::new(
            Opts::new("vm_controller_reconcile_errors_total", "Failed reconciliation passes by error kind"),
            &["kind"],
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "vm_controller_reconcile_duration_seconds",
                "Duration of reconciliation passes",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 120.0]),
        )?;
        let driver_calls_total = IntCounterVec::new(
            Opts::new("vm_controller_driver_calls_total", "Runtime driver calls by operation and result"),
            &["operation", "result"],
        )?;
        let queue_depth = IntGauge::new("vm_controller_queue_depth", "Resources waiting in the work queue")?;

        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(reconcile_errors_total.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(driver_calls_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            reconcile_total,
            reconcile_errors_total,
            reconcile_duration,
            driver_calls_total,
            queue_depth,
        })
    }

    /// Record a finished pass.
    pub fn pass_completed(&self, outcome: &str, elapsed: Duration) {
        self.reconcile_total.with_label_values(&[outcome]).inc();
        self.reconcile_duration.observe(elapsed.as_secs_f64());
    }

    /// Record a failed pass.
    pub fn pass_failed(&self, kind: &str, elapsed: Duration) {
        self.reconcile_total.with_label_values(&["error"]).inc();
        self.reconcile_errors_total.with_label_values(&[kind]).inc();
        self.reconcile_duration.observe(elapsed.as_secs_f64());
    }

    pub fn driver_call(&self, operation: &str, result: &str) {
        self.driver_calls_total.with_label_values(&[operation, result]).inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    #[cfg(test)]
    pub(crate) fn driver_call_count(&self, operation: &str, result: &str) -> u64 {
        self.driver_calls_total.with_label_values(&[operation, result]).get()
    }

    #[cfg(test)]
    pub(crate) fn pass_count(&self, outcome: &str) -> u64 {
        self.reconcile_total.with_label_values(&[outcome]).get()
    }
}
