//! Metrics module for Prometheus-based monitoring.
//!
//! Consumer loops, the generation worker and the relay record through
//! [`MetricsCollector`]; both processes expose the registry on `GET /metrics`.
//!
//! # Example
//!
//! ```ignore
//! use askbus::metrics::{init_metrics, export_metrics, MetricsCollector, EntryOutcome};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_entry("answers:requests", EntryOutcome::Acked, 1.5);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{EntryOutcome, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics, metrics_handler, REGISTRY};
