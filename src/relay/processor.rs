//! Consumer-loop processor that pushes change notifications to subscribers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::registry::{BroadcastReport, SubscriptionRegistry};
use crate::error::ProcessError;
use crate::events::RelayedNotification;
use crate::metrics::MetricsCollector;
use crate::stream::{Entry, Processor};

/// Fans each [`RelayedNotification`] out to the connections of its parent.
pub struct NotificationRelay {
    registry: Arc<SubscriptionRegistry>,
    metrics: MetricsCollector,
}

impl NotificationRelay {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            registry,
            metrics: MetricsCollector::new(),
        }
    }

    /// Broadcasts the entity of `notification` to its parent's subscribers.
    pub fn relay(&self, notification: &RelayedNotification) -> BroadcastReport {
        let parent = notification.parent();
        let kind = notification.kind().as_str();

        let report = self.registry.broadcast(parent, notification.entity_json());
        self.metrics
            .record_notification(kind, report.delivered, report.dropped);

        debug!(
            kind,
            parent = %parent,
            delivered = report.delivered,
            dropped = report.dropped,
            "Relayed notification"
        );

        report
    }
}

#[async_trait]
impl Processor for NotificationRelay {
    async fn process(&self, entry: &Entry) -> Result<(), ProcessError> {
        let notification = RelayedNotification::decode(&entry.payload)
            .map_err(|e| ProcessError::Malformed(format!("notification {}: {}", entry.id, e)))?;

        self.relay(&notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Parent;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_question_goes_to_course_subscribers() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (tx, mut rx) = mpsc::channel(4);
        registry.subscribe(Parent::Course("2".to_string()), tx);

        let relay = NotificationRelay::new(registry);
        let entry = Entry::new(
            "1-0",
            r#"{"type":"question","data":{"id":5,"course_id":2,"question":"Q?"}}"#,
        );
        relay.process(&entry).await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            r#"{"id":5,"course_id":2,"question":"Q?"}"#
        );
    }

    #[tokio::test]
    async fn test_answer_goes_to_question_subscribers_only() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (question_tx, mut question_rx) = mpsc::channel(4);
        let (course_tx, mut course_rx) = mpsc::channel(4);
        registry.subscribe(Parent::Question("9".to_string()), question_tx);
        registry.subscribe(Parent::Course("9".to_string()), course_tx);

        let relay = NotificationRelay::new(registry);
        let entry = Entry::new(
            "2-0",
            r#"{"type":"answer","data":{"id":1,"question_id":9,"answer":"A"}}"#,
        );
        relay.process(&entry).await.unwrap();

        assert!(question_rx.recv().await.is_some());
        assert!(course_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_subscribers_is_not_an_error() {
        let relay = NotificationRelay::new(Arc::new(SubscriptionRegistry::new()));
        let entry = Entry::new(
            "3-0",
            r#"{"type":"answer","data":{"id":1,"question_id":9}}"#,
        );
        relay.process(&entry).await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_notification_is_permanent() {
        let relay = NotificationRelay::new(Arc::new(SubscriptionRegistry::new()));
        let err = relay
            .process(&Entry::new("4-0", r#"{"type":"course","data":{}}"#))
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }
}
