//! Metrics module for Prometheus-based monitoring.
//!
//! Covers submission outcomes, admission pressure, image pulls and cleanup.
//!
//! # Example
//!
//! ```ignore
//! use solution_runner::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_rejection("capacity_exceeded");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, metrics_handler};

pub use prometheus::{
    ADMITTED, ADMITTED_MEMORY_MB, CLEANUP_FAILURES, CONSISTENCY_FAULTS, EXECUTION_DURATION,
    IMAGE_PULLS_TOTAL, REGISTRY, REJECTIONS_TOTAL, SUBMISSIONS_TOTAL,
};
