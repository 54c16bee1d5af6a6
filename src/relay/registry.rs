//! Per-process map from parent entity to the live connections watching it.
//!
//! The registry is created when the relay starts and shared by reference with
//! the websocket accept handler and the notification processor. Nothing in it
//! survives a restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::events::Parent;
use crate::metrics::MetricsCollector;

/// Identifier of one live connection within a registry.
pub type ConnectionId = u64;

/// What a broadcast reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the message was queued for.
    pub delivered: usize,
    /// Connections whose queue was full or already closed.
    pub dropped: usize,
}

/// Subscription registry keyed by [`Parent`].
///
/// Every mutation and every broadcast runs under one lock. The lock is never
/// held across an await: broadcasts only enqueue onto each connection's
/// bounded outbound queue and never wait for the socket.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscribers: Mutex<HashMap<Parent, HashMap<ConnectionId, mpsc::Sender<String>>>>,
    next_id: AtomicU64,
    metrics: MetricsCollector,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Parent, HashMap<ConnectionId, mpsc::Sender<String>>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a connection's outbound queue under `parent`.
    pub fn subscribe(&self, parent: Parent, sender: mpsc::Sender<String>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let total = {
            let mut subscribers = self.lock();
            subscribers
                .entry(parent.clone())
                .or_default()
                .insert(id, sender);
            count(&subscribers)
        };

        self.metrics.set_subscriptions(total);
        debug!(parent = %parent, connection = id, "Connection subscribed");
        id
    }

    /// Removes a connection; the set for `parent` is dropped once empty.
    ///
    /// Returns false if the connection was not registered under `parent`.
    pub fn unsubscribe(&self, parent: &Parent, id: ConnectionId) -> bool {
        let (removed, total) = {
            let mut subscribers = self.lock();
            let removed = match subscribers.get_mut(parent) {
                Some(connections) => {
                    let removed = connections.remove(&id).is_some();
                    if connections.is_empty() {
                        subscribers.remove(parent);
                    }
                    removed
                }
                None => false,
            };
            (removed, count(&subscribers))
        };

        if removed {
            self.metrics.set_subscriptions(total);
            debug!(parent = %parent, connection = id, "Connection unsubscribed");
        }
        removed
    }

    /// Queues `message` for every connection subscribed to `parent`.
    ///
    /// No subscribers means the message is dropped; nothing is buffered for
    /// connections that arrive later.
    pub fn broadcast(&self, parent: &Parent, message: &str) -> BroadcastReport {
        let subscribers = self.lock();
        let Some(connections) = subscribers.get(parent) else {
            return BroadcastReport::default();
        };

        let mut report = BroadcastReport::default();
        for (id, sender) in connections {
            match sender.try_send(message.to_string()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(parent = %parent, connection = id, "Outbound queue full, message dropped");
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => report.dropped += 1,
            }
        }
        report
    }

    /// Number of connections subscribed to `parent`.
    pub fn subscriber_count(&self, parent: &Parent) -> usize {
        self.lock().get(parent).map_or(0, HashMap::len)
    }

    /// Total number of registered connections.
    pub fn len(&self) -> usize {
        count(&self.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether any set exists under `parent`.
    pub fn contains(&self, parent: &Parent) -> bool {
        self.lock().contains_key(parent)
    }
}

fn count(subscribers: &HashMap<Parent, HashMap<ConnectionId, mpsc::Sender<String>>>) -> usize {
    subscribers.values().map(HashMap::len).sum()
}
