//! Client for the text-generation inference endpoint.
//!
//! The endpoint receives the answer request as its JSON body and replies with
//! a JSON array whose first element carries a `generated_text` string:
//!
//! ```text
//! POST <url>   {"questionId": 9, "question": "How?"}
//! 200 OK       [{"generated_text": "Like this."}]
//! ```

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::InferenceError;
use crate::events::AnswerRequest;
use crate::metrics::MetricsCollector;

/// Anything able to turn an answer request into generated text.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Generates one candidate answer for the request.
    async fn generate(&self, request: &AnswerRequest) -> Result<String, InferenceError>;
}

/// Configuration for [`HttpInference`].
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Full URL the request is POSTed to.
    pub url: String,
    /// Optional bearer token.
    pub token: Option<String>,
    /// Optional request timeout; calls are unbounded when `None`.
    pub timeout: Option<Duration>,
}

impl InferenceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            timeout: None,
        }
    }

    /// Set the bearer token sent with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Bound every request by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One element of the endpoint's response array.
#[derive(Debug, Deserialize)]
struct GeneratedText {
    generated_text: String,
}

/// Inference client speaking HTTP through `reqwest`.
pub struct HttpInference {
    config: InferenceConfig,
    http_client: Client,
    metrics: MetricsCollector,
}

impl HttpInference {
    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns `InferenceError::RequestFailed` if the HTTP client cannot be built.
    pub fn new(config: InferenceConfig) -> Result<Self, InferenceError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let http_client = builder
            .build()
            .map_err(|e| InferenceError::RequestFailed(e.to_string()))?;

        Ok(Self {
            config,
            http_client,
            metrics: MetricsCollector::new(),
        })
    }

    async fn call(&self, request: &AnswerRequest) -> Result<String, InferenceError> {
        let mut http_request = self
            .http_client
            .post(&self.config.url)
            .header("Content-Type", "application/json");

        if let Some(ref token) = self.config.token {
            http_request = http_request.header("Authorization", format!("Bearer {}", token));
        }

        let http_response = http_request
            .json(request)
            .send()
            .await
            .map_err(|e| InferenceError::RequestFailed(e.to_string()))?;

        let status = http_response.status();
        if !status.is_success() {
            let message = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(InferenceError::ApiError {
                code: status.as_u16(),
                message,
            });
        }

        let body = http_response
            .text()
            .await
            .map_err(|e| InferenceError::RequestFailed(e.to_string()))?;

        parse_generated_text(&body)
    }
}

#[async_trait]
impl InferenceClient for HttpInference {
    async fn generate(&self, request: &AnswerRequest) -> Result<String, InferenceError> {
        let started = Instant::now();
        let result = self.call(request).await;
        let latency = started.elapsed();

        self.metrics
            .record_inference(result.is_ok(), latency.as_secs_f64());
        debug!(
            question_id = request.question_id,
            latency_ms = latency.as_millis() as u64,
            success = result.is_ok(),
            "Inference call finished"
        );

        result
    }
}

/// Extracts the first `generated_text` from a response body.
pub fn parse_generated_text(body: &str) -> Result<String, InferenceError> {
    let candidates: Vec<GeneratedText> = serde_json::from_str(body)
        .map_err(|e| InferenceError::ParseError(format!("Failed to parse response: {}", e)))?;

    candidates
        .into_iter()
        .next()
        .map(|c| c.generated_text)
        .ok_or(InferenceError::EmptyResponse)
}
