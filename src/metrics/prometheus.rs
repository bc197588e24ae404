//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by solution-runner and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all solution-runner metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Terminal submissions, labeled by status and language.
pub static SUBMISSIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time from container start to terminal status, labeled by status.
pub static EXECUTION_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Submissions refused at admission, labeled by reason.
pub static REJECTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Submissions currently holding an admission slot.
pub static ADMITTED: OnceLock<Gauge> = OnceLock::new();

/// Memory currently reserved by admitted submissions, in megabytes.
pub static ADMITTED_MEMORY_MB: OnceLock<Gauge> = OnceLock::new();

/// Image pulls, labeled by language and outcome.
pub static IMAGE_PULLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Containers that could not be removed after every retry.
pub static CLEANUP_FAILURES: OnceLock<IntCounter> = OnceLock::new();

/// Internal invariant violations, labeled by kind.
pub static CONSISTENCY_FAULTS: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Later calls
/// are harmless: the first registration stays in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Submission metrics
    let submissions_total = CounterVec::new(
        Opts::new(
            "solution_runner_submissions_total",
            "Submissions that reached a terminal status",
        ),
        &["status", "language"],
    )?;

    let execution_duration = HistogramVec::new(
        HistogramOpts::new(
            "solution_runner_execution_duration_seconds",
            "Time from container start to terminal status",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["status"],
    )?;

    // Admission metrics
    let rejections_total = IntCounterVec::new(
        Opts::new(
            "solution_runner_rejections_total",
            "Submissions refused at admission",
        ),
        &["reason"],
    )?;

    let admitted = Gauge::new(
        "solution_runner_admitted",
        "Submissions currently holding an admission slot",
    )?;

    let admitted_memory_mb = Gauge::new(
        "solution_runner_admitted_memory_mb",
        "Memory reserved by admitted submissions in megabytes",
    )?;

    // Runtime metrics
    let image_pulls_total = IntCounterVec::new(
        Opts::new("solution_runner_image_pulls_total", "Image pull attempts"),
        &["language", "outcome"],
    )?;

    let cleanup_failures = IntCounter::new(
        "solution_runner_cleanup_failures_total",
        "Containers left behind after every removal retry",
    )?;

    let consistency_faults = IntCounterVec::new(
        Opts::new(
            "solution_runner_consistency_faults_total",
            "Internal invariant violations",
        ),
        &["kind"],
    )?;

    registry.register(Box::new(submissions_total.clone()))?;
    registry.register(Box::new(execution_duration.clone()))?;
    registry.register(Box::new(rejections_total.clone()))?;
    registry.register(Box::new(admitted.clone()))?;
    registry.register(Box::new(admitted_memory_mb.clone()))?;
    registry.register(Box::new(image_pulls_total.clone()))?;
    registry.register(Box::new(cleanup_failures.clone()))?;
    registry.register(Box::new(consistency_faults.clone()))?;

    // If any of these fail, metrics were already initialized
    let _ = REGISTRY.set(registry);
    let _ = SUBMISSIONS_TOTAL.set(submissions_total);
    let _ = EXECUTION_DURATION.set(execution_duration);
    let _ = REJECTIONS_TOTAL.set(rejections_total);
    let _ = ADMITTED.set(admitted);
    let _ = ADMITTED_MEMORY_MB.set(admitted_memory_mb);
    let _ = IMAGE_PULLS_TOTAL.set(image_pulls_total);
    let _ = CLEANUP_FAILURES.set(cleanup_failures);
    let _ = CONSISTENCY_FAULTS.set(consistency_faults);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem instead.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Axum handler for `GET /metrics`.
pub async fn metrics_handler() -> String {
    export_metrics()
}
