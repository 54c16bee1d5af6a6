//! Integration tests against a live Redis server.
//!
//! Every test works on its own uniquely named stream.
//! Run with: REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_integration -- --ignored

use std::sync::{Arc, Mutex};
use std::time::Duration;

use askbus::error::ProcessError;
use askbus::stream::{
    Consumer, ConsumerConfig, Entry, EventLog, Processor, ReadCursor, RedisLog,
};
use async_trait::async_trait;
use uuid::Uuid;

async fn connect() -> RedisLog {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    RedisLog::connect(&url)
        .await
        .expect("Redis must be reachable for integration tests")
}

fn unique_stream() -> String {
    format!("askbus-test:{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_group_creation_is_idempotent() {
    let log = connect().await;
    let stream = unique_stream();

    log.ensure_group(&stream, "g").await.unwrap();
    log.append(&stream, "first").await.unwrap();
    let entry = log
        .read_group(&stream, "g", "c", ReadCursor::New, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    log.ack(&stream, "g", &entry.id).await.unwrap();

    // Second creation must not rewind the cursor
    log.ensure_group(&stream, "g").await.unwrap();
    let again = log
        .read_group(&stream, "g", "c", ReadCursor::New, Duration::from_millis(50))
        .await
        .unwrap();
    assert!(again.is_none());
}

#[tokio::test]
#[ignore]
async fn test_unacked_entry_stays_pending_and_is_claimable() {
    let log = connect().await;
    let stream = unique_stream();
    log.ensure_group(&stream, "g").await.unwrap();

    let id = log.append(&stream, r#"{"questionId":1,"question":"?"}"#).await.unwrap();
    let entry = log
        .read_group(&stream, "g", "crashed", ReadCursor::New, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.id, id);
    assert_eq!(log.pending_count(&stream, "g").await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let claimed = log
        .claim_stale(&stream, "g", "live", Duration::from_millis(50), 10)
        .await
        .unwrap();
    assert_eq!(claimed, 1);

    let redelivered = log
        .read_group(&stream, "g", "live", ReadCursor::Pending, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(redelivered.id, id);
    assert_eq!(redelivered.payload, entry.payload);

    log.ack(&stream, "g", &id).await.unwrap();
    assert_eq!(log.pending_count(&stream, "g").await.unwrap(), 0);
}

#[derive(Default)]
struct Collect {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Processor for Collect {
    async fn process(&self, entry: &Entry) -> Result<(), ProcessError> {
        self.seen.lock().unwrap().push(entry.payload.clone());
        Ok(())
    }
}

#[tokio::test]
#[ignore]
async fn test_consumer_loop_over_redis() {
    let log = Arc::new(connect().await);
    let stream = unique_stream();
    let processor = Arc::new(Collect::default());

    let mut consumer = Consumer::new(
        ConsumerConfig::new(&stream, "g").with_block(Duration::from_millis(100)),
        log.clone(),
        processor.clone(),
    );
    consumer.start().unwrap();

    for i in 0..3 {
        log.append(&stream, &format!("payload-{i}")).await.unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while consumer.stats().processed < 3 {
        assert!(tokio::time::Instant::now() < deadline, "entries not processed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    consumer.shutdown().await.unwrap();

    assert_eq!(
        *processor.seen.lock().unwrap(),
        vec!["payload-0", "payload-1", "payload-2"]
    );
    assert_eq!(log.pending_count(&stream, "g").await.unwrap(), 0);
}
