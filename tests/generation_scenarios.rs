//! Generation worker scenarios: requests on the log become stored answers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use askbus::error::InferenceError;
use askbus::events::{AnswerRequest, LANGUAGE_MODEL_AUTHOR};
use askbus::generation::{
    GenerationConfig, GenerationWorker, HttpInference, InferenceClient, InferenceConfig,
};
use askbus::storage::MemoryAnswerStore;
use askbus::stream::{
    Consumer, ConsumerConfig, EventLog, EventProducer, MemoryLog, DEFAULT_GENERATION_GROUP,
    DEFAULT_GENERATION_STREAM, DEFAULT_RELAY_STREAM,
};
use async_trait::async_trait;
use axum::{routing::post, Json, Router};
use tokio::net::TcpListener;

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn consumer_config(consumer_id: &str) -> ConsumerConfig {
    ConsumerConfig::new(DEFAULT_GENERATION_STREAM, DEFAULT_GENERATION_GROUP)
        .with_consumer_id(consumer_id)
        .with_block(Duration::from_millis(20))
        .with_shutdown_timeout(Duration::from_millis(200))
}

/// Starts an inference endpoint answering every request with a numbered text.
async fn start_inference_endpoint() -> String {
    let counter = Arc::new(AtomicU32::new(0));
    let app = Router::new().route(
        "/generate",
        post(move |Json(request): Json<AnswerRequest>| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Json(serde_json::json!([
                    {"generated_text": format!("answer {} to {}", n, request.question)}
                ]))
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/generate")
}

#[tokio::test]
async fn answer_request_yields_three_language_model_answers() {
    let log = Arc::new(MemoryLog::new());
    let store = Arc::new(MemoryAnswerStore::new());
    let inference =
        Arc::new(HttpInference::new(InferenceConfig::new(start_inference_endpoint().await)).unwrap());

    let worker = GenerationWorker::new(GenerationConfig::default(), inference, store.clone())
        .with_producer(EventProducer::new(log.clone()));
    let mut consumer = Consumer::new(consumer_config("worker-1"), log.clone(), Arc::new(worker));
    consumer.start().unwrap();

    log.append(
        DEFAULT_GENERATION_STREAM,
        r#"{"questionId": 9, "question": "How?"}"#,
    )
    .await
    .unwrap();

    wait_until("request processed", || consumer.stats().processed == 1).await;
    consumer.shutdown().await.unwrap();

    let answers = store.answers_for(9);
    assert_eq!(answers.len(), 3);
    for answer in &answers {
        assert_eq!(answer.question_id, 9);
        assert_eq!(answer.user_uuid, LANGUAGE_MODEL_AUTHOR);
        assert!(answer.answer.ends_with("to How?"));
    }
    let mut texts: Vec<_> = answers.iter().map(|a| a.answer.clone()).collect();
    texts.dedup();
    assert_eq!(texts.len(), 3, "each candidate is generated separately");

    // Live clients learn about each generated answer
    let relayed = log.entries(DEFAULT_RELAY_STREAM);
    assert_eq!(relayed.len(), 3);
    let first: serde_json::Value = serde_json::from_str(&relayed[0].payload).unwrap();
    assert_eq!(first["type"], "answer");
    assert_eq!(first["data"]["question_id"], 9);
}

/// Answers the first `hang_after` calls, then never returns.
struct StallsAfter {
    calls: AtomicU32,
    hang_after: u32,
}

#[async_trait]
impl InferenceClient for StallsAfter {
    async fn generate(&self, request: &AnswerRequest) -> Result<String, InferenceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call > self.hang_after {
            std::future::pending::<()>().await;
        }
        Ok(format!("stalled worker answer {} to {}", call, request.question))
    }
}

struct Healthy;

#[async_trait]
impl InferenceClient for Healthy {
    async fn generate(&self, request: &AnswerRequest) -> Result<String, InferenceError> {
        Ok(format!("healthy answer to {}", request.question))
    }
}

#[tokio::test]
async fn worker_dying_mid_request_causes_redelivery_and_extra_answers() {
    let log = Arc::new(MemoryLog::new());
    let store = Arc::new(MemoryAnswerStore::new());

    // The first worker stores one answer, then stalls forever before acking
    let stalled = GenerationWorker::new(
        GenerationConfig::default().with_notify(false),
        Arc::new(StallsAfter {
            calls: AtomicU32::new(0),
            hang_after: 1,
        }),
        store.clone(),
    );
    let mut first = Consumer::new(consumer_config("worker-1"), log.clone(), Arc::new(stalled));
    first.start().unwrap();

    log.append(
        DEFAULT_GENERATION_STREAM,
        r#"{"questionId": 9, "question": "How?"}"#,
    )
    .await
    .unwrap();
    wait_until("first answer", || store.answers_for(9).len() == 1).await;

    // Stopping cannot complete while the request is in flight
    assert!(first.shutdown().await.is_err());
    assert_eq!(log.pending(DEFAULT_GENERATION_STREAM, DEFAULT_GENERATION_GROUP).len(), 1);

    // A second worker claims the idle entry and runs the whole request again
    let healthy = GenerationWorker::new(
        GenerationConfig::default().with_notify(false),
        Arc::new(Healthy),
        store.clone(),
    );
    let mut second = Consumer::new(
        consumer_config("worker-2")
            .with_claim_idle(Duration::from_millis(50))
            .with_claim_interval(Duration::from_millis(20)),
        log.clone(),
        Arc::new(healthy),
    );
    second.start().unwrap();

    wait_until("redelivered request", || second.stats().processed == 1).await;
    second.shutdown().await.unwrap();

    let answers = store.answers_for(9);
    assert_eq!(answers.len(), 4, "one partial attempt plus a full one");
    assert!(answers[0].answer.starts_with("stalled worker"));
    assert!(answers[1..].iter().all(|a| a.answer.starts_with("healthy")));
    assert!(log
        .pending(DEFAULT_GENERATION_STREAM, DEFAULT_GENERATION_GROUP)
        .is_empty());
}

#[tokio::test]
async fn inference_error_leaves_request_pending_for_retry() {
    let log = Arc::new(MemoryLog::new());
    let store = Arc::new(MemoryAnswerStore::new());
    let inference = Arc::new(
        HttpInference::new(InferenceConfig::new("http://127.0.0.1:9/unreachable")).unwrap(),
    );

    let worker = GenerationWorker::new(GenerationConfig::default(), inference, store.clone());
    let mut consumer = Consumer::new(
        consumer_config("worker-1").with_max_failures(100),
        log.clone(),
        Arc::new(worker),
    );
    consumer.start().unwrap();

    log.append(
        DEFAULT_GENERATION_STREAM,
        r#"{"questionId": 3, "question": "Down?"}"#,
    )
    .await
    .unwrap();

    wait_until("failed attempt", || consumer.stats().failed >= 1).await;
    consumer.shutdown().await.unwrap();

    assert!(store.answers().is_empty());
    assert_eq!(consumer.stats().processed, 0);
    assert_eq!(
        log.pending(DEFAULT_GENERATION_STREAM, DEFAULT_GENERATION_GROUP)
            .len(),
        1
    );
}
