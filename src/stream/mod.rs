//! Durable log access and the consumer loop built on top of it.
//!
//! The log is an append-only, ordered sequence of entries per stream, read
//! through consumer groups with explicit per-entry acknowledgment:
//!
//! - **EventLog**: the operations the system needs from the log
//! - **RedisLog**: Redis Streams implementation (`XADD`, `XREADGROUP`, `XACK`, ...)
//! - **MemoryLog**: in-process implementation with the same group semantics
//! - **EventProducer**: typed appends used by the API layer
//! - **Consumer**: the `EnsureGroup → BlockingRead → Process → Ack` loop
//!
//! # Architecture
//!
//! ```text
//!     ┌──────────────┐
//!     │  API layer   │
//!     └──────┬───────┘
//!            │ XADD
//!     ┌──────▼───────┐
//!     │ Redis Stream │
//!     └──────┬───────┘
//!            │ XREADGROUP (one group per worker type)
//!     ┌──────┴──────────────┐
//!     ▼                     ▼
//! ┌──────────┐        ┌──────────┐
//! │ Consumer │  ...   │ Consumer │   one per process, unique consumer id
//! └──────────┘        └──────────┘
//! ```
//!
//! Entries are acknowledged only after processing completes, so delivery is
//! at-least-once: a process that dies between read and ack leaves the entry
//! pending, and a live consumer claims it once it has been idle long enough.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::LogError;

pub mod backoff;
pub mod consumer;
pub mod memory;
pub mod producer;
pub mod redis_log;

pub use backoff::Backoff;
pub use consumer::{Consumer, ConsumerConfig, ConsumerError, ConsumerStats, Processor};
pub use memory::MemoryLog;
pub use producer::{EventProducer, PublishOutcome};
pub use redis_log::RedisLog;

/// Name of the single field every entry carries its JSON payload in.
pub const DATA_FIELD: &str = "data";

/// Default stream carrying answer-generation requests.
pub const DEFAULT_GENERATION_STREAM: &str = "answers:requests";

/// Default stream carrying change notifications for the relay.
pub const DEFAULT_RELAY_STREAM: &str = "events:relay";

/// Default consumer group shared by all generation workers.
pub const DEFAULT_GENERATION_GROUP: &str = "generation";

/// Default consumer group shared by all relay processes.
pub const DEFAULT_RELAY_GROUP: &str = "relay";

/// Returns the dead letter stream paired with `stream`.
pub fn dead_letter_stream(stream: &str) -> String {
    format!("{}:dead_letter", stream)
}

/// A single entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Broker-assigned id, used for acknowledgment.
    pub id: String,
    /// Serialized payload from the entry's `data` field.
    pub payload: String,
}

impl Entry {
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }
}

/// Where a group read starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries never delivered to any consumer of the group (`>`).
    New,
    /// Entries already delivered to this consumer and not yet acknowledged (`0`).
    Pending,
}

impl ReadCursor {
    /// Returns the id argument passed to `XREADGROUP`.
    pub fn as_id(&self) -> &'static str {
        match self {
            ReadCursor::New => ">",
            ReadCursor::Pending => "0",
        }
    }
}

/// Operations the producers and consumer loops need from the durable log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends a serialized payload and returns the assigned entry id.
    async fn append(&self, stream: &str, payload: &str) -> Result<String, LogError>;

    /// Creates the group at the stream origin if it does not exist yet.
    ///
    /// Calling this on an existing group succeeds and leaves its cursor alone.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), LogError>;

    /// Reads at most one entry for `consumer`.
    ///
    /// With [`ReadCursor::New`] the call waits up to `block` for an entry and
    /// returns `Ok(None)` on timeout. [`ReadCursor::Pending`] never blocks.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        block: Duration,
    ) -> Result<Option<Entry>, LogError>;

    /// Acknowledges an entry, removing it from the group's pending set.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), LogError>;

    /// Moves entries pending on other consumers for at least `min_idle` to
    /// `consumer`, returning how many were claimed.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<usize, LogError>;

    /// Returns the number of delivered but unacknowledged entries in the group.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, LogError>;

    /// Returns up to `count` entries from the start of the stream.
    async fn range(&self, stream: &str, count: usize) -> Result<Vec<Entry>, LogError>;
}
