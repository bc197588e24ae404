//! High-level metrics recording.
//!
//! `MetricsCollector` wraps the raw Prometheus statics so callers never deal
//! with label ordering. Every method is a no-op until `init_metrics()` ran,
//! which keeps library use and tests free of global setup.

use super::prometheus::{
    ADMITTED, ADMITTED_MEMORY_MB, CLEANUP_FAILURES, CONSISTENCY_FAULTS, EXECUTION_DURATION,
    IMAGE_PULLS_TOTAL, REJECTIONS_TOTAL, SUBMISSIONS_TOTAL,
};

/// Metrics collector for recording solution-runner operational metrics.
///
/// # Example
///
/// ```ignore
/// use solution_runner::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_terminal("DONE", "python", Some(0.42));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a submission reaching a terminal status.
    ///
    /// `runtime_secs` is `None` when the container never started.
    pub fn record_terminal(&self, status: &str, language: &str, runtime_secs: Option<f64>) {
        if let Some(total) = SUBMISSIONS_TOTAL.get() {
            total.with_label_values(&[status, language]).inc();
        }

        if let (Some(duration), Some(secs)) = (EXECUTION_DURATION.get(), runtime_secs) {
            duration.with_label_values(&[status]).observe(secs);
        }

        tracing::trace!(
            status = status,
            language = language,
            runtime_secs = runtime_secs,
            "Recorded terminal submission"
        );
    }

    /// Record an admission rejection.
    pub fn record_rejection(&self, reason: &str) {
        if let Some(rejections) = REJECTIONS_TOTAL.get() {
            rejections.with_label_values(&[reason]).inc();
        }
    }

    /// Update the admission gauges.
    pub fn update_admitted(&self, count: usize, memory_mb: u64) {
        if let Some(gauge) = ADMITTED.get() {
            gauge.set(count as f64);
        }
        if let Some(gauge) = ADMITTED_MEMORY_MB.get() {
            gauge.set(memory_mb as f64);
        }
    }

    /// Record an image pull outcome (`"success"` or `"failure"`).
    pub fn record_image_pull(&self, language: &str, outcome: &str) {
        if let Some(pulls) = IMAGE_PULLS_TOTAL.get() {
            pulls.with_label_values(&[language, outcome]).inc();
        }
    }

    /// Record a container that could not be removed.
    pub fn record_cleanup_failure(&self) {
        if let Some(counter) = CLEANUP_FAILURES.get() {
            counter.inc();
        }
    }

    /// Record an internal invariant violation.
    pub fn record_consistency_fault(&self, kind: &str) {
        if let Some(faults) = CONSISTENCY_FAULTS.get() {
            faults.with_label_values(&[kind]).inc();
        }
    }
}
