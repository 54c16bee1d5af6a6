//! Lifecycle of one subscriber websocket.
//!
//! ```text
//!  Open ──subscribe──► Subscribed ──begin_close──► Closing ──finish_close──► Closed
//!    │                                                ▲
//!    └──────────────────────begin_close───────────────┘
//! ```
//!
//! The registry is touched only on `Open → Subscribed` (insert) and
//! `Subscribed → Closing` (remove). Any other request is rejected, so a late
//! close can never remove a connection twice and a closed connection can never
//! be re-registered.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::registry::{ConnectionId, SubscriptionRegistry};
use crate::events::Parent;

/// Keep-alive text frame sent to every subscriber.
pub const PING_MESSAGE: &str = "ping";

/// Tunables for subscriber connections.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Interval between keep-alive frames.
    pub ping_interval: Duration,
    /// Capacity of each connection's outbound queue.
    pub queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            queue_capacity: 64,
        }
    }
}

impl RelayConfig {
    /// Set the keep-alive interval.
    pub fn with_ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }

    /// Set the outbound queue capacity, at least one.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity.max(1);
        self
    }
}

/// States of a subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Subscribed,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Open => "open",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A transition the state machine does not allow.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid connection transition from {from} to {to}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Registry membership of one connection, driven through verified transitions.
pub struct Connection {
    parent: Parent,
    registry: Arc<SubscriptionRegistry>,
    state: ConnectionState,
    id: Option<ConnectionId>,
}

impl Connection {
    pub fn new(parent: Parent, registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            parent,
            registry,
            state: ConnectionState::Open,
            id: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn parent(&self) -> &Parent {
        &self.parent
    }

    /// Connection id, assigned once subscribed.
    pub fn id(&self) -> Option<ConnectionId> {
        self.id
    }

    fn transition(&mut self, to: ConnectionState) -> Result<ConnectionState, TransitionError> {
        use ConnectionState::*;

        let allowed = matches!(
            (self.state, to),
            (Open, Subscribed) | (Open, Closing) | (Subscribed, Closing) | (Closing, Closed)
        );
        if !allowed {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }

        let from = self.state;
        self.state = to;
        Ok(from)
    }

    /// `Open → Subscribed`: registers the outbound queue.
    pub fn subscribe(&mut self, sender: mpsc::Sender<String>) -> Result<ConnectionId, TransitionError> {
        self.transition(ConnectionState::Subscribed)?;
        let id = self.registry.subscribe(self.parent.clone(), sender);
        self.id = Some(id);
        Ok(id)
    }

    /// `Open | Subscribed → Closing`: leaves the registry if subscribed.
    pub fn begin_close(&mut self) -> Result<(), TransitionError> {
        let from = self.transition(ConnectionState::Closing)?;
        if from == ConnectionState::Subscribed {
            if let Some(id) = self.id {
                self.registry.unsubscribe(&self.parent, id);
            }
        }
        Ok(())
    }

    /// `Closing → Closed`.
    pub fn finish_close(&mut self) -> Result<(), TransitionError> {
        self.transition(ConnectionState::Closed).map(|_| ())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // A task aborted mid-connection still leaves the registry
        if self.state == ConnectionState::Subscribed {
            let _ = self.begin_close();
        }
    }
}

/// Why a connection loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    ClientClosed,
    StreamEnded,
    SendFailed,
    Shutdown,
}

/// Serves one upgraded websocket until it closes.
///
/// Inbound frames are ignored apart from close and ping; the socket carries
/// keep-alive pings and relayed entities outward.
pub async fn run_connection(
    socket: WebSocket,
    parent: Parent,
    registry: Arc<SubscriptionRegistry>,
    config: RelayConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(config.queue_capacity);

    let mut connection = Connection::new(parent, registry);
    let id = match connection.subscribe(outbound_tx) {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "Failed to subscribe connection");
            return;
        }
    };
    info!(parent = %connection.parent(), connection = id, "Subscriber connected");

    let mut ticker = interval(config.ping_interval);
    ticker.tick().await; // Skip the immediate first tick

    let reason = loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(text) = outbound else {
                    break CloseReason::StreamEnded;
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break CloseReason::SendFailed;
                }
            }
            _ = ticker.tick() => {
                if sender.send(Message::Text(PING_MESSAGE.into())).await.is_err() {
                    break CloseReason::SendFailed;
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) => break CloseReason::ClientClosed,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break CloseReason::SendFailed;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(connection = id, error = %e, "WebSocket error");
                        break CloseReason::StreamEnded;
                    }
                    None => break CloseReason::StreamEnded,
                }
            }
            _ = shutdown_rx.recv() => break CloseReason::Shutdown,
        }
    };

    if let Err(e) = connection.begin_close() {
        warn!(connection = id, error = %e, "Unexpected connection state on close");
    }
    drop(outbound_rx);

    if reason != CloseReason::SendFailed {
        let _ = sender.send(Message::Close(None)).await;
    }
    let _ = connection.finish_close();

    info!(
        parent = %connection.parent(),
        connection = id,
        reason = ?reason,
        "Subscriber disconnected"
    );
}
