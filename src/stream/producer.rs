//! Typed appends used by the API layer.
//!
//! Every payload is serialized to JSON and appended as the `data` field of a
//! new entry. When one action notifies two streams the appends are issued
//! independently: a failure on one stream neither prevents nor rolls back the
//! other, and both results are reported back to the caller.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::{EventLog, DEFAULT_GENERATION_STREAM, DEFAULT_RELAY_STREAM};
use crate::error::{LogError, PublishError};
use crate::events::{AnswerData, AnswerRequest, ChangeNotification, QuestionData};

/// Results of the two independent appends made for a new question.
#[derive(Debug)]
pub struct PublishOutcome {
    /// Append of the `question` notification to the relay stream.
    pub relay: Result<String, LogError>,
    /// Append of the answer request to the generation stream.
    pub generation: Result<String, PublishError>,
}

impl PublishOutcome {
    /// Returns true if both appends succeeded.
    pub fn is_complete(&self) -> bool {
        self.relay.is_ok() && self.generation.is_ok()
    }
}

/// Appends domain events to the relay and generation streams.
#[derive(Clone)]
pub struct EventProducer {
    log: Arc<dyn EventLog>,
    relay_stream: String,
    generation_stream: String,
}

impl EventProducer {
    /// Creates a producer writing to the default stream names.
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self {
            log,
            relay_stream: DEFAULT_RELAY_STREAM.to_string(),
            generation_stream: DEFAULT_GENERATION_STREAM.to_string(),
        }
    }

    /// Sets the relay stream name.
    pub fn with_relay_stream(mut self, stream: impl Into<String>) -> Self {
        self.relay_stream = stream.into();
        self
    }

    /// Sets the generation-request stream name.
    pub fn with_generation_stream(mut self, stream: impl Into<String>) -> Self {
        self.generation_stream = stream.into();
        self
    }

    pub fn relay_stream(&self) -> &str {
        &self.relay_stream
    }

    pub fn generation_stream(&self) -> &str {
        &self.generation_stream
    }

    /// Serializes `payload` and appends it to `stream`, returning the entry id.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        stream: &str,
        payload: &T,
    ) -> Result<String, LogError> {
        let serialized = serde_json::to_string(payload)?;
        let id = self.log.append(stream, &serialized).await?;
        debug!(stream = %stream, entry_id = %id, "Published event");
        Ok(id)
    }

    /// Publishes a new question: a notification for live subscribers of its
    /// course, and a request for generated answers.
    pub async fn question_created(&self, question: QuestionData, text: &str) -> PublishOutcome {
        let request = question_request(&question, text);
        let notification = ChangeNotification::Question(question);

        let relay = self.publish(&self.relay_stream, &notification).await;
        if let Err(e) = &relay {
            warn!(stream = %self.relay_stream, error = %e, "Failed to publish question notification");
        }

        let generation = match request {
            Some(request) => self.request_answers(&request).await.map_err(PublishError::from),
            None => Err(PublishError::InvalidEvent(
                "question id is not an integer".to_string(),
            )),
        };
        if let Err(e) = &generation {
            warn!(stream = %self.generation_stream, error = %e, "Failed to publish answer request");
        }

        PublishOutcome { relay, generation }
    }

    /// Publishes a new answer to live subscribers of its question.
    pub async fn answer_created(&self, answer: AnswerData) -> Result<String, LogError> {
        let notification = ChangeNotification::Answer(answer);
        self.publish(&self.relay_stream, &notification).await
    }

    /// Asks the generation workers for machine answers.
    pub async fn request_answers(&self, request: &AnswerRequest) -> Result<String, LogError> {
        self.publish(&self.generation_stream, request).await
    }
}

/// Builds the answer request for a question row, which needs an integer `id`.
fn question_request(question: &QuestionData, text: &str) -> Option<AnswerRequest> {
    let id = question.fields.get("id")?;
    let question_id = match id {
        serde_json::Value::Number(n) => n.as_i64()?,
        serde_json::Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    Some(AnswerRequest::new(question_id, text))
}
