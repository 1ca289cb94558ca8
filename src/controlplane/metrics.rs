//! Operator metrics
//!
//! `main.rs` registers them with the default Prometheus registry, which the
//! metrics endpoint serves. Tests use a private registry.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::time::Duration;

/// Reconcile metrics
#[derive(Clone)]
pub struct Metrics {
    /// 1 while the CR is healthy, the `HPPNotReady` alert watches it
    pub cr_ready: IntGauge,
    pub reconcile_passes: IntCounter,
    pub reconcile_failures: IntCounter,
    pub reconcile_duration: Histogram,
}

impl Metrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self {
            cr_ready: IntGauge::with_opts(Opts::new(
                "kubevirt_hpp_cr_ready",
                "Whether the HostPathProvisioner custom resource is ready",
            ))?,
            reconcile_passes: IntCounter::with_opts(Opts::new(
                "kubevirt_hpp_operator_reconcile_total",
                "Reconcile passes of the HostPathProvisioner",
            ))?,
            reconcile_failures: IntCounter::with_opts(Opts::new(
                "kubevirt_hpp_operator_reconcile_failures_total",
                "Reconcile passes that ended in an error",
            ))?,
            reconcile_duration: Histogram::with_opts(
                HistogramOpts::new(
                    "kubevirt_hpp_operator_reconcile_duration_seconds",
                    "Duration of reconcile passes",
                )
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            )?,
        };
        registry.register(Box::new(metrics.cr_ready.clone()))?;
        registry.register(Box::new(metrics.reconcile_passes.clone()))?;
        registry.register(Box::new(metrics.reconcile_failures.clone()))?;
        registry.register(Box::new(metrics.reconcile_duration.clone()))?;
        Ok(metrics)
    }

    /// Record the end of a pass
    pub fn observe_pass(&self, elapsed: Duration, failed: bool) {
        self.reconcile_passes.inc();
        if failed {
            self.reconcile_failures.inc();
        }
        self.reconcile_duration.observe(elapsed.as_secs_f64());
    }

    pub fn set_ready(&self, ready: bool) {
        self.cr_ready.set(i64::from(ready));
    }
}
