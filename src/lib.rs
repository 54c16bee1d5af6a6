//! askbus: event relay and generation workers for a Q&A service.
//!
//! API processes append events to Redis Streams. Two kinds of background
//! process consume them through consumer groups with at-least-once delivery:
//!
//! - **Generation workers** turn answer requests into machine-generated
//!   answers via an inference endpoint and store them.
//! - **Notification relays** push new questions and answers to websocket
//!   clients subscribed to the parent course or question.

pub mod cli;
pub mod error;
pub mod events;
pub mod generation;
pub mod metrics;
pub mod relay;
pub mod storage;
pub mod stream;

// Re-export commonly used error types
pub use error::{InferenceError, LogError, ProcessError, PublishError, StoreError};
