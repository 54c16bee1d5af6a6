//! Consumer-loop processor that turns answer requests into stored answers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::inference::InferenceClient;
use crate::error::{LogError, ProcessError};
use crate::events::{AnswerRequest, LANGUAGE_MODEL_AUTHOR};
use crate::metrics::MetricsCollector;
use crate::storage::AnswerStore;
use crate::stream::{Entry, EventProducer, Processor};

/// Number of candidate answers generated per request.
pub const DEFAULT_CANDIDATES: u32 = 3;

/// Configuration for [`GenerationWorker`].
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Candidate answers generated and stored per request.
    pub candidates: u32,
    /// Publish each stored answer to the relay stream.
    pub notify: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            candidates: DEFAULT_CANDIDATES,
            notify: true,
        }
    }
}

impl GenerationConfig {
    /// Set the number of candidates, at least one.
    pub fn with_candidates(mut self, candidates: u32) -> Self {
        self.candidates = candidates.max(1);
        self
    }

    /// Enable or disable relay notifications for stored answers.
    pub fn with_notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }
}

/// Generates and stores machine answers for each [`AnswerRequest`] entry.
///
/// Each candidate is generated, stored, and optionally announced before the
/// next one starts. Any failure aborts the remaining candidates and returns
/// the error to the consumer loop, which leaves the entry pending. Candidates
/// stored before the failure stay stored, so a redelivered request can add
/// more answers than `candidates`.
pub struct GenerationWorker {
    config: GenerationConfig,
    inference: Arc<dyn InferenceClient>,
    store: Arc<dyn AnswerStore>,
    producer: Option<EventProducer>,
    metrics: MetricsCollector,
}

impl GenerationWorker {
    pub fn new(
        config: GenerationConfig,
        inference: Arc<dyn InferenceClient>,
        store: Arc<dyn AnswerStore>,
    ) -> Self {
        Self {
            config,
            inference,
            store,
            producer: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Use `producer` to announce stored answers when notifications are enabled.
    pub fn with_producer(mut self, producer: EventProducer) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Runs every candidate for one request.
    pub async fn generate_answers(&self, request: &AnswerRequest) -> Result<u32, ProcessError> {
        for candidate in 1..=self.config.candidates {
            let text = self.inference.generate(request).await?;
            let answer = self
                .store
                .create_answer(request.question_id, LANGUAGE_MODEL_AUTHOR, &text)
                .await?;
            self.metrics.record_answer_generated();

            debug!(
                question_id = request.question_id,
                answer_id = answer.id,
                candidate = candidate,
                "Stored generated answer"
            );

            if let Some(producer) = self.producer.as_ref().filter(|_| self.config.notify) {
                let data = answer.to_data().map_err(LogError::from)?;
                producer.answer_created(data).await?;
            }
        }

        Ok(self.config.candidates)
    }
}

#[async_trait]
impl Processor for GenerationWorker {
    async fn process(&self, entry: &Entry) -> Result<(), ProcessError> {
        let request: AnswerRequest = serde_json::from_str(&entry.payload)
            .map_err(|e| ProcessError::Malformed(format!("answer request {}: {}", entry.id, e)))?;

        let stored = self.generate_answers(&request).await?;
        info!(
            entry_id = %entry.id,
            question_id = request.question_id,
            answers = stored,
            "Generated answers"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InferenceError;
    use crate::storage::MemoryAnswerStore;
    use crate::stream::{MemoryLog, DEFAULT_RELAY_STREAM};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Returns "candidate N" and fails on the call numbered `fail_on`.
    struct Scripted {
        calls: AtomicU32,
        fail_on: Option<u32>,
    }

    impl Scripted {
        fn new(fail_on: Option<u32>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_on,
            }
        }
    }

    #[async_trait]
    impl InferenceClient for Scripted {
        async fn generate(&self, _request: &AnswerRequest) -> Result<String, InferenceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(call) == self.fail_on {
                return Err(InferenceError::EmptyResponse);
            }
            Ok(format!("candidate {}", call))
        }
    }

    fn entry(payload: &str) -> Entry {
        Entry::new("1-0", payload)
    }

    #[tokio::test]
    async fn test_three_candidates_are_stored_as_language_model() {
        let store = Arc::new(MemoryAnswerStore::new());
        let worker = GenerationWorker::new(
            GenerationConfig::default(),
            Arc::new(Scripted::new(None)),
            store.clone(),
        );

        worker
            .process(&entry(r#"{"questionId": 9, "question": "How?"}"#))
            .await
            .unwrap();

        let answers = store.answers_for(9);
        assert_eq!(answers.len(), 3);
        assert!(answers.iter().all(|a| a.user_uuid == LANGUAGE_MODEL_AUTHOR));
        assert_eq!(answers[2].answer, "candidate 3");
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_candidates() {
        let store = Arc::new(MemoryAnswerStore::new());
        let worker = GenerationWorker::new(
            GenerationConfig::default(),
            Arc::new(Scripted::new(Some(2))),
            store.clone(),
        );

        let err = worker
            .process(&entry(r#"{"questionId": 9, "question": "How?"}"#))
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Inference(_)));
        assert!(!err.is_permanent());
        assert_eq!(store.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_request_is_permanent() {
        let worker = GenerationWorker::new(
            GenerationConfig::default(),
            Arc::new(Scripted::new(None)),
            Arc::new(MemoryAnswerStore::new()),
        );

        let err = worker
            .process(&entry(r#"{"question": "no id"}"#))
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_stored_answers_are_announced_on_relay_stream() {
        let log = Arc::new(MemoryLog::new());
        let worker = GenerationWorker::new(
            GenerationConfig::default().with_candidates(2),
            Arc::new(Scripted::new(None)),
            Arc::new(MemoryAnswerStore::new()),
        )
        .with_producer(EventProducer::new(log.clone()));

        worker
            .generate_answers(&AnswerRequest::new(4, "Why?"))
            .await
            .unwrap();

        let relayed = log.entries(DEFAULT_RELAY_STREAM);
        assert_eq!(relayed.len(), 2);
        let first: serde_json::Value = serde_json::from_str(&relayed[0].payload).unwrap();
        assert_eq!(first["type"], "answer");
        assert_eq!(first["data"]["question_id"], 4);
        assert_eq!(first["data"]["user_uuid"], LANGUAGE_MODEL_AUTHOR);
    }

    #[tokio::test]
    async fn test_notify_disabled_skips_relay_stream() {
        let log = Arc::new(MemoryLog::new());
        let worker = GenerationWorker::new(
            GenerationConfig::default().with_notify(false),
            Arc::new(Scripted::new(None)),
            Arc::new(MemoryAnswerStore::new()),
        )
        .with_producer(EventProducer::new(log.clone()));

        worker
            .generate_answers(&AnswerRequest::new(4, "Why?"))
            .await
            .unwrap();
        assert!(log.entries(DEFAULT_RELAY_STREAM).is_empty());
    }

    #[test]
    fn test_candidates_at_least_one() {
        assert_eq!(GenerationConfig::default().candidates, 3);
        assert_eq!(GenerationConfig::default().with_candidates(0).candidates, 1);
    }
}
