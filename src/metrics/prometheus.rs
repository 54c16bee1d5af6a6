//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by askbus and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::process_collector::ProcessCollector;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

/// Serializes initialization so concurrent callers cannot split the statics
/// across two registries.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Global Prometheus registry for all askbus metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Entries handled by consumer loops, labeled by stream and outcome.
pub static ENTRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time spent processing a single entry, labeled by stream.
pub static PROCESS_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Consumer loop failures, labeled by stream and the stage that failed.
pub static CONSUMER_ERRORS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Entries claimed from idle consumers, labeled by stream.
pub static CLAIMED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Inference endpoint requests, labeled by status.
pub static INFERENCE_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Inference endpoint latency in seconds.
pub static INFERENCE_LATENCY: OnceLock<Histogram> = OnceLock::new();

/// Answers persisted by generation workers.
pub static ANSWERS_GENERATED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Notifications handled by the relay, labeled by kind and result.
pub static RELAY_NOTIFICATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Messages queued onto subscriber connections.
pub static RELAY_DELIVERIES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Messages dropped because a subscriber queue was full or closed.
pub static RELAY_DROPPED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Currently registered subscriptions.
pub static SUBSCRIPTIONS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Besides the
/// askbus metrics it registers the process collector, which reports resident
/// and virtual memory, CPU time and open file descriptors.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Consumer loop metrics
    let entries_total = CounterVec::new(
        Opts::new("askbus_entries_total", "Stream entries handled by consumer loops"),
        &["stream", "outcome"],
    )?;

    let process_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "askbus_process_duration_seconds",
            "Time spent processing a single entry",
        )
        .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        &["stream"],
    )?;

    let consumer_errors_total = CounterVec::new(
        Opts::new("askbus_consumer_errors_total", "Consumer loop failures"),
        &["stream", "stage"],
    )?;

    let claimed_total = CounterVec::new(
        Opts::new(
            "askbus_claimed_total",
            "Entries claimed from idle consumers",
        ),
        &["stream"],
    )?;

    // Generation metrics
    let inference_requests_total = CounterVec::new(
        Opts::new(
            "askbus_inference_requests_total",
            "Inference endpoint requests",
        ),
        &["status"],
    )?;

    let inference_latency = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "askbus_inference_latency_seconds",
            "Inference endpoint latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
    )?;

    let answers_generated_total = Counter::new(
        "askbus_answers_generated_total",
        "Answers persisted by generation workers",
    )?;

    // Relay metrics
    let relay_notifications_total = CounterVec::new(
        Opts::new(
            "askbus_relay_notifications_total",
            "Notifications handled by the relay",
        ),
        &["kind", "result"],
    )?;

    let relay_deliveries_total = Counter::new(
        "askbus_relay_deliveries_total",
        "Messages queued onto subscriber connections",
    )?;

    let relay_dropped_total = Counter::new(
        "askbus_relay_dropped_total",
        "Messages dropped because a subscriber queue was full or closed",
    )?;

    let subscriptions = Gauge::new("askbus_subscriptions", "Currently registered subscriptions")?;

    // Register all metrics with the registry
    registry.register(Box::new(ProcessCollector::for_self()))?;
    registry.register(Box::new(entries_total.clone()))?;
    registry.register(Box::new(process_duration.clone()))?;
    registry.register(Box::new(consumer_errors_total.clone()))?;
    registry.register(Box::new(claimed_total.clone()))?;
    registry.register(Box::new(inference_requests_total.clone()))?;
    registry.register(Box::new(inference_latency.clone()))?;
    registry.register(Box::new(answers_generated_total.clone()))?;
    registry.register(Box::new(relay_notifications_total.clone()))?;
    registry.register(Box::new(relay_deliveries_total.clone()))?;
    registry.register(Box::new(relay_dropped_total.clone()))?;
    registry.register(Box::new(subscriptions.clone()))?;

    // Store metrics in static variables
    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = ENTRIES_TOTAL.set(entries_total);
    let _ = PROCESS_DURATION.set(process_duration);
    let _ = CONSUMER_ERRORS_TOTAL.set(consumer_errors_total);
    let _ = CLAIMED_TOTAL.set(claimed_total);
    let _ = INFERENCE_REQUESTS_TOTAL.set(inference_requests_total);
    let _ = INFERENCE_LATENCY.set(inference_latency);
    let _ = ANSWERS_GENERATED_TOTAL.set(answers_generated_total);
    let _ = RELAY_NOTIFICATIONS_TOTAL.set(relay_notifications_total);
    let _ = RELAY_DELIVERIES_TOTAL.set(relay_deliveries_total);
    let _ = RELAY_DROPPED_TOTAL.set(relay_dropped_total);
    let _ = SUBSCRIPTIONS.set(subscriptions);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, the returned
/// text is a single comment line describing the problem.
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

/// HTTP handler for the /metrics endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}
