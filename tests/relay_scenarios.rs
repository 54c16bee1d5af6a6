//! End-to-end relay tests: events appended to the log reach websocket clients.
//!
//! Each test starts the relay router on a random port, a consumer loop over
//! the in-memory log, and real websocket clients.

use std::sync::Arc;
use std::time::Duration;

use askbus::events::Parent;
use askbus::relay::{
    build_router, AppState, NotificationRelay, RelayConfig, SubscriptionRegistry, PING_MESSAGE,
};
use askbus::stream::{
    Consumer, ConsumerConfig, EventLog, MemoryLog, DEFAULT_RELAY_GROUP, DEFAULT_RELAY_STREAM,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Relay {
    base_url: String,
    log: Arc<MemoryLog>,
    registry: Arc<SubscriptionRegistry>,
    state: AppState,
    consumer: Consumer,
}

impl Relay {
    async fn start(config: RelayConfig) -> Self {
        let log = Arc::new(MemoryLog::new());
        let registry = Arc::new(SubscriptionRegistry::new());
        let state = AppState::new(registry.clone(), config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut consumer = Consumer::new(
            ConsumerConfig::new(DEFAULT_RELAY_STREAM, DEFAULT_RELAY_GROUP)
                .with_block(Duration::from_millis(20)),
            log.clone(),
            Arc::new(NotificationRelay::new(registry.clone())),
        );
        consumer.start().unwrap();

        Self {
            base_url: format!("ws://{addr}"),
            log,
            registry,
            state,
            consumer,
        }
    }

    async fn connect(&self, path: &str, parent: &Parent) -> Client {
        let before = self.registry.subscriber_count(parent);
        let (client, _response) = connect_async(format!("{}{}", self.base_url, path))
            .await
            .expect("Failed to connect");

        // The subscription is registered by the upgraded connection's task
        wait_until("subscription", || {
            self.registry.subscriber_count(parent) > before
        })
        .await;
        client
    }

    async fn publish(&self, notification: serde_json::Value) {
        self.publish_raw(&notification.to_string()).await;
    }

    async fn publish_raw(&self, payload: &str) {
        self.log.append(DEFAULT_RELAY_STREAM, payload).await.unwrap();
    }

    async fn wait_processed(&self, count: u64) {
        wait_until("relay processing", || {
            self.consumer.stats().processed >= count
        })
        .await;
    }
}

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

/// Next relayed frame text, skipping keep-alive pings; `None` if nothing arrives in time.
async fn next_text(client: &mut Client, within: Duration) -> Option<String> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, client.next()).await {
            Ok(Some(Ok(msg))) if msg.is_text() => {
                let text = msg.to_text().unwrap();
                if text != PING_MESSAGE {
                    return Some(text.to_string());
                }
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_))) | Ok(None) | Err(_) => return None,
        }
    }
}

async fn next_entity(client: &mut Client, within: Duration) -> Option<serde_json::Value> {
    let text = next_text(client, within).await?;
    Some(serde_json::from_str(&text).unwrap())
}

fn course(id: &str) -> Parent {
    Parent::Course(id.to_string())
}

fn question(id: &str) -> Parent {
    Parent::Question(id.to_string())
}

fn quiet() -> RelayConfig {
    RelayConfig::default().with_ping_interval(Duration::from_secs(60))
}

#[tokio::test]
async fn new_question_reaches_course_subscriber() {
    let relay = Relay::start(quiet()).await;
    let mut client = relay.connect("/ws/courses/2", &course("2")).await;

    relay
        .publish_raw(r#"{"type":"question","data":{"id":5,"course_id":2,"question":"Q?"}}"#)
        .await;

    let text = next_text(&mut client, Duration::from_secs(3))
        .await
        .expect("question within 3s");
    assert_eq!(text, r#"{"id":5,"course_id":2,"question":"Q?"}"#);
}

#[tokio::test]
async fn relayed_entity_keeps_published_bytes() {
    let relay = Relay::start(quiet()).await;
    let mut client = relay.connect("/ws/questions/9", &question("9")).await;

    let data = r#"{"id":3,"question_id":9,"big":12345678901234567890123,"score":1.10}"#;
    relay
        .publish_raw(&format!(r#"{{"type":"answer","data":{data}}}"#))
        .await;

    let text = next_text(&mut client, Duration::from_secs(3))
        .await
        .expect("answer within 3s");
    assert_eq!(text, data);
}

#[tokio::test]
async fn numeric_path_ids_are_normalised() {
    let relay = Relay::start(quiet()).await;
    let mut client = relay.connect("/ws/courses/02", &course("2")).await;

    relay
        .publish(json!({"type": "question", "data": {"id": 4, "course_id": 2}}))
        .await;

    let entity = next_entity(&mut client, Duration::from_secs(3))
        .await
        .expect("question within 3s");
    assert_eq!(entity["id"], 4);
}

#[tokio::test]
async fn subscribers_only_receive_their_parent() {
    let relay = Relay::start(quiet()).await;
    let mut course_one = relay.connect("/ws/courses/1", &course("1")).await;
    let mut course_two = relay.connect("/ws/courses/2", &course("2")).await;
    let mut question_two = relay.connect("/ws/questions/2", &question("2")).await;

    relay
        .publish(json!({"type": "answer", "data": {"id": 11, "question_id": 2, "answer": "A"}}))
        .await;
    relay
        .publish(json!({"type": "question", "data": {"id": 12, "course_id": 2, "question": "Q"}}))
        .await;
    relay.wait_processed(2).await;

    let to_course = next_entity(&mut course_two, Duration::from_secs(3)).await.unwrap();
    assert_eq!(to_course["id"], 12);
    let to_question = next_entity(&mut question_two, Duration::from_secs(3)).await.unwrap();
    assert_eq!(to_question["id"], 11);

    let short = Duration::from_millis(300);
    assert!(next_entity(&mut course_one, short).await.is_none());
    assert!(next_entity(&mut course_two, short).await.is_none());
    assert!(next_entity(&mut question_two, short).await.is_none());
}

#[tokio::test]
async fn every_subscriber_receives_a_broadcast_exactly_once() {
    let relay = Relay::start(quiet()).await;
    let mut first = relay.connect("/ws/questions/9", &question("9")).await;
    let mut second = relay.connect("/ws/questions/9", &question("9")).await;

    relay
        .publish(json!({"type": "answer", "data": {"id": 1, "question_id": "9", "answer": "A"}}))
        .await;

    for client in [&mut first, &mut second] {
        let entity = next_entity(client, Duration::from_secs(3)).await.unwrap();
        assert_eq!(entity["id"], 1);
        assert!(next_entity(client, Duration::from_millis(300)).await.is_none());
    }
}

#[tokio::test]
async fn late_subscriber_does_not_receive_earlier_notifications() {
    let relay = Relay::start(quiet()).await;

    relay
        .publish(json!({"type": "question", "data": {"id": 1, "course_id": 7}}))
        .await;
    relay.wait_processed(1).await;

    let mut client = relay.connect("/ws/courses/7", &course("7")).await;
    relay
        .publish(json!({"type": "question", "data": {"id": 2, "course_id": 7}}))
        .await;

    let entity = next_entity(&mut client, Duration::from_secs(3)).await.unwrap();
    assert_eq!(entity["id"], 2, "the earlier question is not replayed");
}

#[tokio::test]
async fn idle_connections_receive_keepalive_pings() {
    let relay = Relay::start(RelayConfig::default().with_ping_interval(Duration::from_millis(50))).await;
    let mut client = relay.connect("/ws/courses/3", &course("3")).await;

    let msg = tokio::time::timeout(Duration::from_secs(3), client.next())
        .await
        .expect("ping within 3s")
        .unwrap()
        .unwrap();
    assert_eq!(msg.to_text().unwrap(), PING_MESSAGE);
}

#[tokio::test]
async fn closing_client_leaves_the_registry() {
    let relay = Relay::start(quiet()).await;
    let mut client = relay.connect("/ws/courses/4", &course("4")).await;
    assert_eq!(relay.registry.len(), 1);

    client.close(None).await.unwrap();
    wait_until("unsubscribe", || relay.registry.is_empty()).await;
    assert!(!relay.registry.contains(&course("4")));

    // Broadcasting to the emptied parent is a silent drop
    relay
        .publish(json!({"type": "question", "data": {"id": 1, "course_id": 4}}))
        .await;
    relay.wait_processed(1).await;
}

#[tokio::test]
async fn server_shutdown_closes_connections() {
    let mut relay = Relay::start(quiet()).await;
    let mut client = relay.connect("/ws/questions/5", &question("5")).await;

    relay.state.close_connections();

    let closed = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match client.next().await {
                Some(Ok(msg)) if msg.is_close() => break,
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "client sees the connection close");
    wait_until("unsubscribe", || relay.registry.is_empty()).await;

    relay.consumer.shutdown().await.unwrap();
}

#[tokio::test]
async fn client_frames_are_ignored() {
    let relay = Relay::start(quiet()).await;
    let mut client = relay.connect("/ws/courses/6", &course("6")).await;

    client
        .send(tokio_tungstenite::tungstenite::Message::Ping(vec![1, 2, 3].into()))
        .await
        .unwrap();

    relay
        .publish(json!({"type": "question", "data": {"id": 8, "course_id": 6}}))
        .await;
    let entity = next_entity(&mut client, Duration::from_secs(3)).await.unwrap();
    assert_eq!(entity["id"], 8);
    assert_eq!(relay.registry.subscriber_count(&course("6")), 1);
}
