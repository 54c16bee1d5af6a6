//! Notification relay: change notifications in, websocket pushes out.
//!
//! ```text
//! events:relay ──► Consumer ──► NotificationRelay ──► SubscriptionRegistry
//!                                                          │ try_send
//!                                       ┌──────────────────┼──────────────────┐
//!                                       ▼                  ▼                  ▼
//!                                 connection task    connection task    connection task
//!                                 (ping every 10s)         ...                ...
//! ```
//!
//! One registry is built per process and handed to both the websocket accept
//! handler and the processor. Notifications for a parent with no subscribers
//! are dropped; clients that connect later read history through the API.

pub mod connection;
pub mod processor;
pub mod registry;
pub mod server;

pub use connection::{
    run_connection, Connection, ConnectionState, RelayConfig, TransitionError, PING_MESSAGE,
};
pub use processor::NotificationRelay;
pub use registry::{BroadcastReport, ConnectionId, SubscriptionRegistry};
pub use server::{build_ops_router, build_router, health_handler, serve, AppState, ServeError};
