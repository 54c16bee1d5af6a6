//! In-process event log with consumer-group semantics.
//!
//! Mirrors the parts of Redis Streams the consumer loop relies on: groups with
//! a delivery cursor, a pending entries list per group, blocking reads that
//! wake on append, history reads of a consumer's own pending entries, and
//! claiming of idle entries. Used for local runs and by the test suite.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Entry, EventLog, ReadCursor};
use crate::error::LogError;

/// Bookkeeping for one delivered, unacknowledged entry.
#[derive(Debug, Clone)]
struct PendingInfo {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next entry never delivered to this group.
    cursor: usize,
    /// Pending entries keyed by their index in the stream.
    pending: BTreeMap<usize, PendingInfo>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<Entry>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    /// Last sequence number handed out, shared by all streams.
    sequence: u64,
}

/// A pending entry as reported by [`MemoryLog::pending`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub deliveries: u32,
}

/// In-memory event log.
#[derive(Debug, Default)]
pub struct MemoryLog {
    inner: Mutex<Inner>,
    appended: Notify,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind, still usable
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns every entry appended to `stream`, in order.
    pub fn entries(&self, stream: &str) -> Vec<Entry> {
        self.lock()
            .streams
            .get(stream)
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    /// Returns the group's pending entries in stream order.
    pub fn pending(&self, stream: &str, group: &str) -> Vec<PendingEntry> {
        let inner = self.lock();
        let Some(state) = inner.streams.get(stream) else {
            return Vec::new();
        };
        let Some(group) = state.groups.get(group) else {
            return Vec::new();
        };
        group
            .pending
            .iter()
            .map(|(index, info)| PendingEntry {
                id: state.entries[*index].id.clone(),
                consumer: info.consumer.clone(),
                deliveries: info.deliveries,
            })
            .collect()
    }

    /// Removes a consumer group, like `XGROUP DESTROY`.
    pub fn destroy_group(&self, stream: &str, group: &str) -> bool {
        self.lock()
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.remove(group))
            .is_some()
    }

    fn no_group(stream: &str, group: &str) -> LogError {
        LogError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        }
    }

    fn group_mut<'a>(
        inner: &'a mut Inner,
        stream: &str,
        group: &str,
    ) -> Result<(&'a [Entry], &'a mut GroupState), LogError> {
        let state = inner
            .streams
            .get_mut(stream)
            .ok_or_else(|| Self::no_group(stream, group))?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| Self::no_group(stream, group))?;
        Ok((&state.entries, group_state))
    }

    fn index_of(entries: &[Entry], id: &str) -> Option<usize> {
        entries.iter().position(|e| e.id == id)
    }

    /// Delivers the next undelivered entry, if there is one.
    fn deliver_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<Entry>, LogError> {
        let mut inner = self.lock();
        let (entries, group_state) = Self::group_mut(&mut inner, stream, group)?;

        if group_state.cursor >= entries.len() {
            return Ok(None);
        }

        let index = group_state.cursor;
        group_state.cursor += 1;
        group_state.pending.insert(
            index,
            PendingInfo {
                consumer: consumer.to_string(),
                delivered_at: Instant::now(),
                deliveries: 1,
            },
        );
        Ok(Some(entries[index].clone()))
    }

    /// Redelivers the consumer's oldest pending entry.
    fn deliver_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<Entry>, LogError> {
        let mut inner = self.lock();
        let (entries, group_state) = Self::group_mut(&mut inner, stream, group)?;

        let found = group_state
            .pending
            .iter_mut()
            .find(|(_, info)| info.consumer == consumer);

        Ok(found.map(|(index, info)| {
            info.deliveries += 1;
            info.delivered_at = Instant::now();
            entries[*index].clone()
        }))
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn append(&self, stream: &str, payload: &str) -> Result<String, LogError> {
        let id = {
            let mut inner = self.lock();
            inner.sequence += 1;
            let id = format!("{}-0", inner.sequence);
            inner
                .streams
                .entry(stream.to_string())
                .or_default()
                .entries
                .push(Entry::new(id.clone(), payload));
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), LogError> {
        self.lock()
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        block: Duration,
    ) -> Result<Option<Entry>, LogError> {
        if cursor == ReadCursor::Pending {
            return self.deliver_pending(stream, group, consumer);
        }

        let deadline = Instant::now() + block;
        loop {
            // Register interest before checking so an append in between still wakes us
            let appended = self.appended.notified();

            if let Some(entry) = self.deliver_new(stream, group, consumer)? {
                return Ok(Some(entry));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), LogError> {
        let mut inner = self.lock();
        let (entries, group_state) = Self::group_mut(&mut inner, stream, group)?;
        if let Some(index) = Self::index_of(entries, id) {
            group_state.pending.remove(&index);
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
        let mut inner = self.lock();
        let (_, group_state) = Self::group_mut(&mut inner, stream, group)?;
        let now = Instant::now();

        let mut claimed = 0;
        for info in group_state.pending.values_mut().take(count) {
            if info.consumer != consumer && now.duration_since(info.delivered_at) >= min_idle {
                info.consumer = consumer.to_string();
                info.delivered_at = now;
                info.deliveries += 1;
                claimed += 1;
            }
        }
        Ok(claimed)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, LogError> {
        let mut inner = self.lock();
        let (_, group_state) = Self::group_mut(&mut inner, stream, group)?;
        Ok(group_state.pending.len())
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<Entry>, LogError> {
        Ok(self.entries(stream).into_iter().take(count).collect())
    }
}
