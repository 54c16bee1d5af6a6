//! Consumer loop shared by the generation workers and the notification relay.
//!
//! Each process runs one [`Consumer`] per stream it reads. The loop is an
//! explicit state machine:
//!
//! ```text
//!  ┌─────────────┐  ok   ┌──────────────┐ entry ┌─────────┐  ok  ┌─────┐
//!  │ EnsureGroup ├──────►│ BlockingRead ├──────►│ Process ├─────►│ Ack │
//!  └──────▲──────┘       └──▲───────┬───┘       └────┬────┘      └──┬──┘
//!         │                 │timeout│                │              │
//!         │                 └───────┘                │              │
//!         │                 ▲                        │              │
//!         │                 └────────────────────────┼──────────────┘
//!         │         error (after backoff)            │
//!         └──────────────────────────────────────────┘
//! ```
//!
//! # Reliability
//!
//! - Entries are acknowledged only after processing completes (at-least-once).
//! - A failed entry stays pending. After backing off, the loop re-creates the
//!   group if needed and re-reads its own pending entries before new ones.
//! - An entry that fails `max_failures` times in a row, or whose payload can
//!   never be decoded, is appended to the dead letter stream and acknowledged.
//! - Entries left pending by crashed consumers are claimed once idle.
//! - A panicking processor counts as a failed attempt on that entry.
//! - Shutdown interrupts a blocking read or a backoff sleep. An entry already
//!   read is processed and acknowledged first.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::Backoff;
use super::{
    dead_letter_stream, Entry, EventLog, ReadCursor, DEFAULT_GENERATION_GROUP,
    DEFAULT_GENERATION_STREAM,
};
use crate::error::{LogError, ProcessError};
use crate::metrics::{EntryOutcome, MetricsCollector};

/// Type-specific handling of one entry.
///
/// Implementations must return `Ok` for expected business conditions and
/// reserve errors for infrastructure and downstream failures.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, entry: &Entry) -> Result<(), ProcessError>;
}

/// Errors from starting or stopping a consumer.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Consumer is already running.
    #[error("Consumer is already running")]
    AlreadyRunning,

    /// Consumer is not running.
    #[error("Consumer is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for a consumer loop.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Stream to read.
    pub stream: String,
    /// Consumer group shared by every process of this worker type.
    pub group: String,
    /// Identity of this process within the group, for bookkeeping only.
    pub consumer_id: String,
    /// Upper bound for one blocking read.
    pub block: Duration,
    /// Delay policy between recoveries.
    pub backoff: Backoff,
    /// Consecutive failures of one entry before it is dead-lettered.
    pub max_failures: u32,
    /// How long another consumer's entry must sit unacknowledged before it is claimed.
    pub claim_idle: Duration,
    /// How often to look for idle entries to claim.
    pub claim_interval: Duration,
    /// Maximum pending entries inspected per claim pass.
    pub claim_batch: usize,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_GENERATION_STREAM, DEFAULT_GENERATION_GROUP)
    }
}

impl ConsumerConfig {
    /// Creates a configuration with a fresh random consumer identity.
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        let group = group.into();
        Self {
            stream: stream.into(),
            consumer_id: format!("{}-{}", group, Uuid::new_v4()),
            group,
            block: Duration::from_secs(3),
            backoff: Backoff::DEFAULT,
            max_failures: 5,
            claim_idle: Duration::from_secs(60),
            claim_interval: Duration::from_secs(30),
            claim_batch: 100,
            shutdown_timeout: Duration::from_secs(60),
        }
    }

    /// Sets the consumer identity.
    pub fn with_consumer_id(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = consumer_id.into();
        self
    }

    /// Sets the blocking read bound.
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    /// Sets the backoff policy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the dead-letter threshold.
    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures.max(1);
        self
    }

    /// Sets the idle time after which other consumers' entries are claimed.
    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }

    /// Sets how often idle entries are looked for.
    pub fn with_claim_interval(mut self, claim_interval: Duration) -> Self {
        self.claim_interval = claim_interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Counters describing what a consumer has done so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Entries processed and acknowledged.
    pub processed: u64,
    /// Processing attempts that failed and left the entry pending.
    pub failed: u64,
    /// Entries moved to the dead letter stream.
    pub dead_lettered: u64,
    /// Entries claimed from idle consumers.
    pub claimed: u64,
    /// Times the loop took its error edge.
    pub recoveries: u64,
}

/// Shared state for tracking consumer statistics.
#[derive(Default)]
struct SharedConsumerStats {
    processed: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    claimed: AtomicU64,
    recoveries: AtomicU64,
}

impl SharedConsumerStats {
    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
            claimed: self.claimed.load(Ordering::SeqCst),
            recoveries: self.recoveries.load(Ordering::SeqCst),
        }
    }
}

/// Handle owning one consumer loop task.
pub struct Consumer {
    config: ConsumerConfig,
    log: Arc<dyn EventLog>,
    processor: Arc<dyn Processor>,
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<SharedConsumerStats>,
    is_running: AtomicBool,
}

impl Consumer {
    /// Creates a consumer; nothing is read until [`Consumer::start`].
    pub fn new(
        config: ConsumerConfig,
        log: Arc<dyn EventLog>,
        processor: Arc<dyn Processor>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            log,
            processor,
            shutdown_tx,
            handle: None,
            stats: Arc::new(SharedConsumerStats::default()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns the consumer loop.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::AlreadyRunning` if the loop is already running.
    pub fn start(&mut self) -> Result<(), ConsumerError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyRunning);
        }

        let consumer_loop = ConsumerLoop {
            config: self.config.clone(),
            log: Arc::clone(&self.log),
            processor: Arc::clone(&self.processor),
            stats: Arc::clone(&self.stats),
            metrics: MetricsCollector::new(),
            recovering: true,
            attempt: 0,
            strikes: None,
            last_claim: None,
            stopping: false,
        };
        let shutdown_rx = self.shutdown_tx.subscribe();

        self.handle = Some(tokio::spawn(consumer_loop.run(shutdown_rx)));
        self.is_running.store(true, Ordering::SeqCst);

        Ok(())
    }

    /// Stops the loop, letting an in-flight entry finish processing first.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::ShutdownTimeout` if the loop does not stop
    /// within the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), ConsumerError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(ConsumerError::NotRunning);
        }

        info!(consumer = %self.config.consumer_id, "Initiating consumer shutdown");

        // Ignore send error - the loop may have already stopped
        let _ = self.shutdown_tx.send(());
        self.is_running.store(false, Ordering::SeqCst);

        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        match tokio::time::timeout(self.config.shutdown_timeout, handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, "Consumer task panicked during shutdown");
                Ok(())
            }
            Err(_) => Err(ConsumerError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current statistics.
    pub fn stats(&self) -> ConsumerStats {
        self.stats.snapshot()
    }

    /// Returns whether the loop is running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns this consumer's identity within its group.
    pub fn consumer_id(&self) -> &str {
        &self.config.consumer_id
    }

    /// Returns the consumer configuration.
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }
}

/// States of the consumer loop.
#[derive(Debug)]
enum LoopState {
    EnsureGroup,
    BlockingRead,
    Process(Entry),
    Ack { entry: Entry, started: Instant },
}

/// The task running the loop.
struct ConsumerLoop {
    config: ConsumerConfig,
    log: Arc<dyn EventLog>,
    processor: Arc<dyn Processor>,
    stats: Arc<SharedConsumerStats>,
    metrics: MetricsCollector,
    /// Read own pending entries before new ones.
    recovering: bool,
    /// Consecutive failures without progress, drives the backoff.
    attempt: u32,
    /// Entry that failed most recently and how many times in a row.
    strikes: Option<(String, u32)>,
    last_claim: Option<Instant>,
    stopping: bool,
}

impl ConsumerLoop {
    async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            stream = %self.config.stream,
            group = %self.config.group,
            consumer = %self.config.consumer_id,
            "Consumer started"
        );

        let mut state = LoopState::EnsureGroup;
        loop {
            // An entry that was read is always carried through to its ack
            let idle = matches!(state, LoopState::EnsureGroup | LoopState::BlockingRead);
            if idle && self.should_stop(&mut shutdown_rx) {
                break;
            }
            state = self.step(state, &mut shutdown_rx).await;
        }

        info!(consumer = %self.config.consumer_id, "Consumer stopped");
    }

    fn should_stop(&mut self, shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
        if !self.stopping {
            match shutdown_rx.try_recv() {
                Ok(())
                | Err(broadcast::error::TryRecvError::Closed)
                | Err(broadcast::error::TryRecvError::Lagged(_)) => self.stopping = true,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }
        }
        self.stopping
    }

    async fn step(
        &mut self,
        state: LoopState,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> LoopState {
        match state {
            LoopState::EnsureGroup => {
                match self
                    .log
                    .ensure_group(&self.config.stream, &self.config.group)
                    .await
                {
                    Ok(()) => LoopState::BlockingRead,
                    Err(e) => self.recover("ensure_group", e.into(), shutdown_rx).await,
                }
            }
            LoopState::BlockingRead => {
                let read = tokio::select! {
                    read = self.next_entry() => read,
                    _ = shutdown_rx.recv() => {
                        self.stopping = true;
                        return LoopState::BlockingRead;
                    }
                };

                match read {
                    Ok(Some(entry)) => LoopState::Process(entry),
                    Ok(None) => {
                        // An idle timeout is progress as far as the backoff is concerned
                        self.attempt = 0;
                        LoopState::BlockingRead
                    }
                    Err(e) => self.recover("read", e.into(), shutdown_rx).await,
                }
            }
            LoopState::Process(entry) => {
                let started = Instant::now();
                debug!(
                    stream = %self.config.stream,
                    entry_id = %entry.id,
                    "Processing entry"
                );

                let outcome = AssertUnwindSafe(self.processor.process(&entry))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(ProcessError::Panicked(panic_message(&*panic))));

                match outcome {
                    Ok(()) => LoopState::Ack { entry, started },
                    Err(e) => self.handle_failure(entry, e, started, shutdown_rx).await,
                }
            }
            LoopState::Ack { entry, started } => {
                match self
                    .log
                    .ack(&self.config.stream, &self.config.group, &entry.id)
                    .await
                {
                    Ok(()) => {
                        self.attempt = 0;
                        self.clear_strikes(&entry.id);
                        self.stats.processed.fetch_add(1, Ordering::SeqCst);
                        self.metrics.record_entry(
                            &self.config.stream,
                            EntryOutcome::Acked,
                            started.elapsed().as_secs_f64(),
                        );
                        debug!(
                            stream = %self.config.stream,
                            entry_id = %entry.id,
                            duration_ms = started.elapsed().as_millis() as u64,
                            "Entry acknowledged"
                        );
                        LoopState::BlockingRead
                    }
                    Err(e) => self.recover("ack", e.into(), shutdown_rx).await,
                }
            }
        }
    }

    /// Claims idle entries when due, then reads own pending entries while
    /// recovering, then waits for a new entry.
    async fn next_entry(&mut self) -> Result<Option<Entry>, LogError> {
        if self.claim_due() {
            self.last_claim = Some(Instant::now());
            let claimed = self
                .log
                .claim_stale(
                    &self.config.stream,
                    &self.config.group,
                    &self.config.consumer_id,
                    self.config.claim_idle,
                    self.config.claim_batch,
                )
                .await?;

            if claimed > 0 {
                info!(
                    stream = %self.config.stream,
                    consumer = %self.config.consumer_id,
                    claimed = claimed,
                    "Claimed idle entries from other consumers"
                );
                self.stats
                    .claimed
                    .fetch_add(claimed as u64, Ordering::SeqCst);
                self.metrics.record_claimed(&self.config.stream, claimed);
                self.recovering = true;
            }
        }

        if self.recovering {
            let pending = self
                .log
                .read_group(
                    &self.config.stream,
                    &self.config.group,
                    &self.config.consumer_id,
                    ReadCursor::Pending,
                    Duration::ZERO,
                )
                .await?;

            match pending {
                Some(entry) => return Ok(Some(entry)),
                None => self.recovering = false,
            }
        }

        self.log
            .read_group(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer_id,
                ReadCursor::New,
                self.config.block,
            )
            .await
    }

    fn claim_due(&self) -> bool {
        match self.last_claim {
            None => true,
            Some(at) => at.elapsed() >= self.config.claim_interval,
        }
    }

    /// Records a failure of `entry_id` and returns its consecutive count.
    fn strike(&mut self, entry_id: &str) -> u32 {
        let count = match &self.strikes {
            Some((id, count)) if id == entry_id => count + 1,
            _ => 1,
        };
        self.strikes = Some((entry_id.to_string(), count));
        count
    }

    fn clear_strikes(&mut self, entry_id: &str) {
        if matches!(&self.strikes, Some((id, _)) if id == entry_id) {
            self.strikes = None;
        }
    }

    async fn handle_failure(
        &mut self,
        entry: Entry,
        error: ProcessError,
        started: Instant,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> LoopState {
        let strikes = self.strike(&entry.id);

        if error.is_permanent() || strikes >= self.config.max_failures {
            warn!(
                stream = %self.config.stream,
                entry_id = %entry.id,
                strikes = strikes,
                error = %error,
                "Moving entry to dead letter stream"
            );

            return match self.dead_letter(&entry, &error).await {
                Ok(()) => {
                    self.clear_strikes(&entry.id);
                    self.stats.dead_lettered.fetch_add(1, Ordering::SeqCst);
                    self.metrics.record_entry(
                        &self.config.stream,
                        EntryOutcome::DeadLettered,
                        started.elapsed().as_secs_f64(),
                    );
                    LoopState::BlockingRead
                }
                Err(e) => self.recover("dead_letter", e.into(), shutdown_rx).await,
            };
        }

        warn!(
            stream = %self.config.stream,
            entry_id = %entry.id,
            strikes = strikes,
            max_failures = self.config.max_failures,
            "Entry processing failed, leaving it pending for redelivery"
        );
        self.stats.failed.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_entry(
            &self.config.stream,
            EntryOutcome::Failed,
            started.elapsed().as_secs_f64(),
        );

        self.recover("process", error, shutdown_rx).await
    }

    /// Appends the entry and its failure to the dead letter stream, then acks it.
    async fn dead_letter(&self, entry: &Entry, error: &ProcessError) -> Result<(), LogError> {
        let record = serde_json::json!({
            "entry_id": entry.id,
            "stream": self.config.stream,
            "group": self.config.group,
            "consumer": self.config.consumer_id,
            "payload": entry.payload,
            "error": error.to_string(),
            "failed_at": chrono::Utc::now().to_rfc3339(),
        });

        self.log
            .append(&dead_letter_stream(&self.config.stream), &record.to_string())
            .await?;
        self.log
            .ack(&self.config.stream, &self.config.group, &entry.id)
            .await
    }

    /// Error edge: log, back off, then go back to group setup.
    async fn recover(
        &mut self,
        stage: &'static str,
        error: ProcessError,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> LoopState {
        let delay = self.config.backoff.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.recovering = true;
        self.stats.recoveries.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_consumer_error(&self.config.stream, stage);

        error!(
            stream = %self.config.stream,
            group = %self.config.group,
            consumer = %self.config.consumer_id,
            stage = stage,
            error = %error,
            retry_in_ms = delay.as_millis() as u64,
            "Consumer loop failed, re-creating group after backoff"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.recv() => self.stopping = true,
        }

        LoopState::EnsureGroup
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "processor panicked".to_string()
    }
}
