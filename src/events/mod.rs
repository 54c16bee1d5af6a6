//! Event payloads carried on the streams.
//!
//! Two payload shapes travel through the log:
//!
//! - [`AnswerRequest`] on the generation-request stream, asking the workers to
//!   produce machine answers for a question.
//! - [`ChangeNotification`] on the relay stream, carrying the full denormalized
//!   entity so the relay never has to query storage.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};

/// Author recorded on every answer produced by the generation workers.
pub const LANGUAGE_MODEL_AUTHOR: &str = "language model";

/// Identifier of a stored entity.
///
/// The API layer emits ids as JSON numbers while websocket paths carry them as
/// text, so both forms are accepted and compared through [`EntityId::as_key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    Text(String),
}

impl EntityId {
    /// Parses an id from text, preferring the integer form.
    pub fn parse(raw: &str) -> Self {
        raw.parse::<i64>()
            .map(EntityId::Int)
            .unwrap_or_else(|_| EntityId::Text(raw.to_string()))
    }

    /// Returns the canonical text form used as a registry key.
    ///
    /// Numeric text is normalised, so `"02"` and `2` share a key.
    pub fn as_key(&self) -> String {
        match self {
            EntityId::Int(id) => id.to_string(),
            EntityId::Text(id) => id
                .parse::<i64>()
                .map(|n| n.to_string())
                .unwrap_or_else(|_| id.clone()),
        }
    }
}

/// Request for machine-generated answers to a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRequest {
    /// Question the generated answers are attached to.
    pub question_id: i64,
    /// Question text forwarded to the inference endpoint.
    pub question: String,
}

impl AnswerRequest {
    pub fn new(question_id: i64, question: impl Into<String>) -> Self {
        Self {
            question_id,
            question: question.into(),
        }
    }
}

/// A question row as published by the API layer.
///
/// Only `course_id` is interpreted; every other field is forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionData {
    pub course_id: EntityId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// An answer row as published by the API layer or a generation worker.
///
/// Only `question_id` is interpreted; every other field is forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerData {
    pub question_id: EntityId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Notification that an entity was created, pushed to live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ChangeNotification {
    Question(QuestionData),
    Answer(AnswerData),
}

/// Variant tag of a [`ChangeNotification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Question,
    Answer,
}

impl NotificationKind {
    /// Short name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Question => "question",
            NotificationKind::Answer => "answer",
        }
    }
}

/// Scope under which live connections subscribe.
///
/// Questions fan out to the subscribers of their course, answers to the
/// subscribers of their question.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Parent {
    Course(String),
    Question(String),
}

impl fmt::Display for Parent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parent::Course(id) => write!(f, "course:{}", id),
            Parent::Question(id) => write!(f, "question:{}", id),
        }
    }
}

impl Parent {
    /// Key for the subscribers of a course, from its textual id.
    pub fn course(id: &str) -> Self {
        Parent::Course(EntityId::parse(id).as_key())
    }

    /// Key for the subscribers of a question, from its textual id.
    pub fn question(id: &str) -> Self {
        Parent::Question(EntityId::parse(id).as_key())
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: NotificationKind,
    data: Box<RawValue>,
}

#[derive(Deserialize)]
struct CourseRef {
    course_id: EntityId,
}

#[derive(Deserialize)]
struct QuestionRef {
    question_id: EntityId,
}

/// A change notification read off the relay stream.
///
/// Only the parent id is interpreted. The entity text is kept exactly as it
/// was published, so subscribers see the API layer's bytes.
#[derive(Debug)]
pub struct RelayedNotification {
    kind: NotificationKind,
    parent: Parent,
    entity: Box<RawValue>,
}

impl RelayedNotification {
    /// Decodes a relay-stream payload.
    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(payload)?;
        let parent = match envelope.kind {
            NotificationKind::Question => {
                let CourseRef { course_id } = serde_json::from_str(envelope.data.get())?;
                Parent::Course(course_id.as_key())
            }
            NotificationKind::Answer => {
                let QuestionRef { question_id } = serde_json::from_str(envelope.data.get())?;
                Parent::Question(question_id.as_key())
            }
        };

        Ok(Self {
            kind: envelope.kind,
            parent,
            entity: envelope.data,
        })
    }

    pub fn kind(&self) -> NotificationKind {
        self.kind
    }

    /// Registry key whose subscribers receive this notification.
    pub fn parent(&self) -> &Parent {
        &self.parent
    }

    /// The entity as published, which is what subscribers receive.
    pub fn entity_json(&self) -> &str {
        self.entity.get()
    }
}
