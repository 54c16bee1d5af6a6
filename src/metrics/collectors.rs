//! Metric recording helpers for askbus operations.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with consistent labels.
//! Every method is a no-op until `init_metrics()` has run, so library code and
//! tests can record freely without initializing a registry.

use super::prometheus::{
    ANSWERS_GENERATED_TOTAL, CLAIMED_TOTAL, CONSUMER_ERRORS_TOTAL, ENTRIES_TOTAL,
    INFERENCE_LATENCY, INFERENCE_REQUESTS_TOTAL, PROCESS_DURATION, RELAY_DELIVERIES_TOTAL,
    RELAY_DROPPED_TOTAL, RELAY_NOTIFICATIONS_TOTAL, SUBSCRIPTIONS,
};

/// Final outcome of one consumed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Acked,
    Failed,
    DeadLettered,
}

impl EntryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryOutcome::Acked => "acked",
            EntryOutcome::Failed => "failed",
            EntryOutcome::DeadLettered => "dead_lettered",
        }
    }
}

/// Metrics collector for recording askbus operational metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record the outcome of one processed entry.
    pub fn record_entry(&self, stream: &str, outcome: EntryOutcome, duration_secs: f64) {
        if let Some(entries) = ENTRIES_TOTAL.get() {
            entries
                .with_label_values(&[stream, outcome.as_str()])
                .inc();
        }

        if let Some(duration) = PROCESS_DURATION.get() {
            duration.with_label_values(&[stream]).observe(duration_secs);
        }

        tracing::trace!(
            stream = stream,
            outcome = outcome.as_str(),
            duration_secs = duration_secs,
            "Recorded entry metric"
        );
    }

    /// Record a consumer loop failure at `stage` (ensure_group, read, ack, ...).
    pub fn record_consumer_error(&self, stream: &str, stage: &str) {
        if let Some(errors) = CONSUMER_ERRORS_TOTAL.get() {
            errors.with_label_values(&[stream, stage]).inc();
        }
    }

    /// Record entries claimed from idle consumers.
    pub fn record_claimed(&self, stream: &str, count: usize) {
        if let Some(claimed) = CLAIMED_TOTAL.get() {
            claimed.with_label_values(&[stream]).inc_by(count as f64);
        }
    }

    /// Record an inference endpoint call.
    pub fn record_inference(&self, success: bool, latency_secs: f64) {
        let status = if success { "success" } else { "failure" };

        if let Some(requests) = INFERENCE_REQUESTS_TOTAL.get() {
            requests.with_label_values(&[status]).inc();
        }

        if let Some(latency) = INFERENCE_LATENCY.get() {
            latency.observe(latency_secs);
        }
    }

    /// Record a persisted machine-generated answer.
    pub fn record_answer_generated(&self) {
        if let Some(answers) = ANSWERS_GENERATED_TOTAL.get() {
            answers.inc();
        }
    }

    /// Record one relayed notification and how many connections it reached.
    pub fn record_notification(&self, kind: &str, delivered: usize, dropped: usize) {
        let result = if delivered + dropped == 0 {
            "no_subscribers"
        } else {
            "broadcast"
        };

        if let Some(notifications) = RELAY_NOTIFICATIONS_TOTAL.get() {
            notifications.with_label_values(&[kind, result]).inc();
        }
        if let Some(deliveries) = RELAY_DELIVERIES_TOTAL.get() {
            deliveries.inc_by(delivered as f64);
        }
        if let Some(dropped_total) = RELAY_DROPPED_TOTAL.get() {
            dropped_total.inc_by(dropped as f64);
        }
    }

    /// Set the current number of registered subscriptions.
    pub fn set_subscriptions(&self, count: usize) {
        if let Some(subscriptions) = SUBSCRIPTIONS.get() {
            subscriptions.set(count as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_outcome_labels() {
        assert_eq!(EntryOutcome::Acked.as_str(), "acked");
        assert_eq!(EntryOutcome::Failed.as_str(), "failed");
        assert_eq!(EntryOutcome::DeadLettered.as_str(), "dead_lettered");
    }

    #[test]
    fn test_recording_shows_up_in_export() {
        init_metrics().unwrap();
        let collector = MetricsCollector::new();

        collector.record_entry("test:stream", EntryOutcome::Acked, 0.02);
        collector.record_consumer_error("test:stream", "read");
        collector.record_notification("question", 2, 1);
        collector.set_subscriptions(3);

        let metrics = export_metrics();
        assert!(metrics.contains("askbus_entries_total"));
        assert!(metrics.contains("test:stream"));
        assert!(metrics.contains("askbus_relay_notifications_total"));
        assert!(metrics.contains("askbus_subscriptions"));
    }
}
