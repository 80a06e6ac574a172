//! Operator metrics

use crate::crd::StatusState;
use crate::error::{Error, Result};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::time::Duration;

/// Reconcile and status projection metrics
#[derive(Clone)]
pub struct Metrics {
    reconciles: IntCounterVec,
    failures: IntCounterVec,
    duration: HistogramVec,
    projections: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        Ok(Self {
            reconciles: IntCounterVec::new(
                Opts::new("storage_operator_reconciles_total", "Reconcile passes by resource kind"),
                &["kind"],
            )
            .map_err(internal)?,
            failures: IntCounterVec::new(
                Opts::new(
                    "storage_operator_reconcile_failures_total",
                    "Failed reconcile passes by resource kind and error class",
                ),
                &["kind", "class"],
            )
            .map_err(internal)?,
            duration: HistogramVec::new(
                HistogramOpts::new(
                    "storage_operator_reconcile_duration_seconds",
                    "Duration of reconcile passes",
                )
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
                &["kind"],
            )
            .map_err(internal)?,
            projections: IntCounterVec::new(
                Opts::new(
                    "storage_operator_status_projections_total",
                    "Status writes from the content watch by resulting state",
                ),
                &["state"],
            )
            .map_err(internal)?,
        })
    }

    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.reconciles.clone())).map_err(internal)?;
        registry.register(Box::new(self.failures.clone())).map_err(internal)?;
        registry.register(Box::new(self.duration.clone())).map_err(internal)?;
        registry.register(Box::new(self.projections.clone())).map_err(internal)?;
        Ok(())
    }

    /// Record one reconcile pass
    pub fn reconciled(&self, kind: &str, elapsed: Duration, error: Option<&Error>) {
        self.reconciles.with_label_values(&[kind]).inc();
        self.duration
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
        if let Some(error) = error {
            let class = if error.is_validation() { "validation" } else { "retryable" };
            self.failures.with_label_values(&[kind, class]).inc();
        }
    }

    pub fn projection(&self, state: StatusState) {
        self.projections
            .with_label_values(&[&state.to_string()])
            .inc();
    }
}

fn internal(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
