//! Error types for askbus operations.
//!
//! Defines error types for the subsystems the consumer loops depend on:
//! - Durable log access (Redis Streams)
//! - Event publishing
//! - Inference endpoint calls
//! - Answer persistence
//! - Entry processing, which folds the above together

use thiserror::Error;

/// Errors that can occur while talking to the durable log.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Consumer group '{group}' does not exist on stream '{stream}'")]
    NoGroup { stream: String, group: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LogError {
    /// Returns true when the error means the consumer group is gone.
    pub fn is_missing_group(&self) -> bool {
        match self {
            LogError::NoGroup { .. } => true,
            LogError::Redis(e) => e.code() == Some("NOGROUP"),
            _ => false,
        }
    }
}

/// Errors that can occur while publishing a domain event.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error(transparent)]
    Log(#[from] LogError),
}

/// Errors that can occur when calling the inference endpoint.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Inference endpoint error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Failed to parse inference response: {0}")]
    ParseError(String),

    #[error("Inference response contained no generated text")]
    EmptyResponse,
}

/// Errors that can occur while persisting answers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),
}

/// Errors raised while processing a single entry.
///
/// Every variant except [`ProcessError::Malformed`] sends the entry back through
/// the consumer loop's retry path; malformed payloads can never succeed and are
/// dead-lettered straight away.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Log error: {0}")]
    Log(#[from] LogError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Processor panicked: {0}")]
    Panicked(String),
}

impl ProcessError {
    /// Returns true if retrying the entry can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProcessError::Malformed(_))
    }
}
