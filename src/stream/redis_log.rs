//! Redis Streams implementation of the durable log.
//!
//! Each stream is a Redis stream key. Entries carry a single `data` field
//! holding the JSON payload:
//!
//! - `XADD {stream} * data {json}` appends
//! - `XGROUP CREATE {stream} {group} 0 MKSTREAM` creates a group at the origin
//! - `XREADGROUP GROUP {group} {consumer} COUNT 1 BLOCK {ms} STREAMS {stream} >`
//!   reads the next undelivered entry
//! - `XACK {stream} {group} {id}` removes an entry from the pending set
//! - `XPENDING` + `XCLAIM` move entries held by dead consumers to a live one
//!
//! # Reliability
//!
//! An entry stays in the group's pending entries list from delivery until it is
//! acknowledged. If a consumer crashes, its pending entries survive in Redis and
//! are claimed by another consumer once they have been idle long enough.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamRangeReply,
    StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use tracing::{debug, warn};

use super::{Entry, EventLog, ReadCursor, DATA_FIELD};
use crate::error::LogError;

/// Error code Redis replies with when a group already exists.
const BUSYGROUP: &str = "BUSYGROUP";

/// Redis Streams backed event log.
///
/// Cloning the connection manager is cheap; every operation works on its own
/// clone so a single `RedisLog` can be shared behind an `Arc`.
#[derive(Clone)]
pub struct RedisLog {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
}

impl RedisLog {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `LogError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, LogError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| LogError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| LogError::ConnectionFailed(e.to_string()))?;

        Ok(Self { redis })
    }

    /// Creates a log from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

/// Converts a raw stream entry into an [`Entry`].
///
/// Entries deleted from the stream while still pending come back with no
/// fields; they surface with an empty payload and fail decoding downstream.
fn to_entry(stream_id: StreamId) -> Entry {
    let payload = match stream_id.get::<String>(DATA_FIELD) {
        Some(payload) => payload,
        None => {
            warn!(entry_id = %stream_id.id, "Stream entry has no data field");
            String::new()
        }
    };
    Entry::new(stream_id.id, payload)
}

#[async_trait]
impl EventLog for RedisLog {
    async fn append(&self, stream: &str, payload: &str) -> Result<String, LogError> {
        let mut conn = self.redis.clone();
        let id: String = conn.xadd(stream, "*", &[(DATA_FIELD, payload)]).await?;
        debug!(stream = %stream, entry_id = %id, "Appended entry");
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), LogError> {
        let mut conn = self.redis.clone();
        let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;

        match result {
            Ok(()) => {
                debug!(stream = %stream, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some(BUSYGROUP) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        block: Duration,
    ) -> Result<Option<Entry>, LogError> {
        let mut conn = self.redis.clone();

        let mut options = StreamReadOptions::default().group(group, consumer).count(1);
        if cursor == ReadCursor::New && !block.is_zero() {
            options = options.block(block.as_millis() as usize);
        }

        // A blocking read that times out replies with nil
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[cursor.as_id()], &options)
            .await?;

        let entry = reply
            .and_then(|reply| reply.keys.into_iter().next())
            .and_then(|key| key.ids.into_iter().next())
            .map(to_entry);

        Ok(entry)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), LogError> {
        let mut conn = self.redis.clone();
        let acked: usize = conn.xack(stream, group, &[id]).await?;
        if acked == 0 {
            // Already acknowledged, e.g. by a consumer that claimed it meanwhile
            debug!(stream = %stream, group = %group, entry_id = %id, "Ack matched no pending entry");
        }
        Ok(())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<usize, LogError> {
        let mut conn = self.redis.clone();
        let min_idle_ms = min_idle.as_millis() as usize;

        let pending: StreamPendingCountReply =
            conn.xpending_count(stream, group, "-", "+", count).await?;

        let stale: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.consumer != consumer && p.last_delivered_ms >= min_idle_ms)
            .map(|p| p.id)
            .collect();

        if stale.is_empty() {
            return Ok(0);
        }

        let claimed: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms, &stale)
            .await?;

        Ok(claimed.ids.len())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, LogError> {
        let mut conn = self.redis.clone();
        let reply: StreamPendingReply = conn.xpending(stream, group).await?;
        Ok(reply.count())
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<Entry>, LogError> {
        let mut conn = self.redis.clone();
        let reply: StreamRangeReply = conn.xrange_count(stream, "-", "+", count).await?;
        Ok(reply.ids.into_iter().map(to_entry).collect())
    }
}
