//! Prometheus metrics for Infrastructure reconciliations

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    /// Finished operations by operation and result
    pub reconciliations_total: CounterVec,
    /// Failed operations by operation and error kind
    pub reconcile_errors_total: CounterVec,
    /// Operation duration in seconds
    pub reconcile_duration_seconds: HistogramVec,
    pub registry: Arc<Registry>,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let reconciliations_total = CounterVec::new(
            Opts::new(
                "infrastructure_operations_total",
                "Finished Infrastructure operations",
            ),
            &["operation", "result"],
        )?;

        let reconcile_errors_total = CounterVec::new(
            Opts::new(
                "infrastructure_operation_errors_total",
                "Failed Infrastructure operations by error kind",
            ),
            &["operation", "kind"],
        )?;

        // Terraformer runs take minutes
        let reconcile_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "infrastructure_operation_duration_seconds",
                "Duration of Infrastructure operations in seconds",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 3600.0]),
            &["operation"],
        )?;

        registry.register(Box::new(reconciliations_total.clone()))?;
        registry.register(Box::new(reconcile_errors_total.clone()))?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;

        Ok(Self {
            reconciliations_total,
            reconcile_errors_total,
            reconcile_duration_seconds,
            registry,
        })
    }

    pub fn observe_success(&self, operation: &str, duration: Duration) {
        self.reconciliations_total
            .with_label_values(&[operation, "success"])
            .inc();
        self.reconcile_duration_seconds
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_failure(&self, operation: &str, kind: &str, duration: Duration) {
        self.reconciliations_total
            .with_label_values(&[operation, "error"])
            .inc();
        self.reconcile_errors_total
            .with_label_values(&[operation, kind])
            .inc();
        self.reconcile_duration_seconds
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
