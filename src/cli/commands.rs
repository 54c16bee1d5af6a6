//! CLI command definitions for askbus.
//!
//! Every process reads its connection settings from flags with environment
//! fallbacks, so the same binary runs as a relay, a generation worker, or a
//! one-shot publisher.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::events::{AnswerData, AnswerRequest, EntityId, QuestionData};
use crate::generation::{GenerationConfig, GenerationWorker, HttpInference, InferenceConfig};
use crate::metrics::init_metrics;
use crate::relay::{
    build_ops_router, build_router, serve, AppState, NotificationRelay, RelayConfig,
    SubscriptionRegistry,
};
use crate::storage::PgAnswerStore;
use crate::stream::{
    dead_letter_stream, Consumer, ConsumerConfig, EventLog, EventProducer, PublishOutcome,
    RedisLog,
    DEFAULT_GENERATION_GROUP, DEFAULT_GENERATION_STREAM, DEFAULT_RELAY_GROUP,
    DEFAULT_RELAY_STREAM,
};

/// Default Redis connection string.
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Event relay and generation workers for the Q&A service.
#[derive(Parser)]
#[command(name = "askbus")]
#[command(about = "Relay Q&A change notifications and generate machine answers")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Push new questions and answers to websocket subscribers.
    Relay(RelayArgs),

    /// Generate machine answers for requested questions.
    Worker(Box<WorkerArgs>),

    /// Append an event, as the API layer does.
    #[command(subcommand)]
    Publish(PublishCommand),

    /// Show entries moved to a stream's dead letter stream.
    #[command(name = "dead-letters")]
    DeadLetters(DeadLetterArgs),
}

/// Connection to the durable log.
#[derive(Args, Debug, Clone)]
pub struct LogArgs {
    /// Redis connection string.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,
}

/// Settings shared by both consumer processes.
#[derive(Args, Debug, Clone)]
pub struct ConsumerArgs {
    /// Consecutive failures of one entry before it is dead-lettered.
    #[arg(long, env = "MAX_FAILURES", default_value = "5")]
    pub max_failures: u32,

    /// Seconds an entry must sit unacknowledged before another consumer claims it.
    #[arg(long, env = "CLAIM_IDLE_SECS", default_value = "60")]
    pub claim_idle_secs: u64,
}

impl ConsumerArgs {
    fn config(&self, stream: &str, group: &str) -> ConsumerConfig {
        ConsumerConfig::new(stream, group)
            .with_max_failures(self.max_failures)
            .with_claim_idle(Duration::from_secs(self.claim_idle_secs))
    }
}

/// Arguments for `askbus relay`.
#[derive(Args, Debug)]
pub struct RelayArgs {
    #[command(flatten)]
    pub log: LogArgs,

    #[command(flatten)]
    pub consumer: ConsumerArgs,

    /// Stream carrying change notifications.
    #[arg(long, env = "RELAY_STREAM", default_value = DEFAULT_RELAY_STREAM)]
    pub stream: String,

    /// Consumer group shared by relay processes.
    #[arg(long, env = "RELAY_GROUP", default_value = DEFAULT_RELAY_GROUP)]
    pub group: String,

    /// Address serving websockets, /metrics and /health.
    #[arg(long, env = "RELAY_LISTEN", default_value = "0.0.0.0:8081")]
    pub listen: SocketAddr,

    /// Seconds between keep-alive pings.
    #[arg(long, default_value = "10")]
    pub ping_interval_secs: u64,

    /// Messages buffered per connection before new ones are dropped.
    #[arg(long, default_value = "64")]
    pub queue_capacity: usize,
}

/// Arguments for `askbus worker`.
#[derive(Args, Debug)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub log: LogArgs,

    #[command(flatten)]
    pub consumer: ConsumerArgs,

    /// Stream carrying answer requests.
    #[arg(long, env = "GENERATION_STREAM", default_value = DEFAULT_GENERATION_STREAM)]
    pub stream: String,

    /// Consumer group shared by generation workers.
    #[arg(long, env = "GENERATION_GROUP", default_value = DEFAULT_GENERATION_GROUP)]
    pub group: String,

    /// Stream generated answers are announced on.
    #[arg(long, env = "RELAY_STREAM", default_value = DEFAULT_RELAY_STREAM)]
    pub relay_stream: String,

    /// PostgreSQL connection string.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// URL the answer request is POSTed to.
    #[arg(long, env = "INFERENCE_URL")]
    pub inference_url: String,

    /// Bearer token for the inference endpoint.
    #[arg(long, env = "INFERENCE_TOKEN", hide_env_values = true)]
    pub inference_token: Option<String>,

    /// Inference request timeout in seconds; unbounded when omitted.
    #[arg(long, env = "INFERENCE_TIMEOUT_SECS")]
    pub inference_timeout_secs: Option<u64>,

    /// Candidate answers generated per request.
    #[arg(long, default_value = "3")]
    pub candidates: u32,

    /// Do not announce generated answers to live subscribers.
    #[arg(long)]
    pub no_notify: bool,

    /// Address serving /metrics and /health.
    #[arg(long, env = "WORKER_LISTEN", default_value = "0.0.0.0:9090")]
    pub listen: SocketAddr,
}

/// Events `askbus publish` can append.
#[derive(Subcommand, Debug)]
pub enum PublishCommand {
    /// A new question: notifies its course and requests generated answers.
    Question {
        #[command(flatten)]
        log: LogArgs,
        /// Question id.
        #[arg(long)]
        id: i64,
        /// Course the question belongs to.
        #[arg(long)]
        course_id: String,
        /// Question text.
        #[arg(long)]
        text: String,
    },

    /// A new answer: notifies the subscribers of its question.
    Answer {
        #[command(flatten)]
        log: LogArgs,
        /// Answer id.
        #[arg(long)]
        id: i64,
        /// Question the answer belongs to.
        #[arg(long)]
        question_id: String,
        /// Answer text.
        #[arg(long)]
        text: String,
        /// Author recorded on the answer.
        #[arg(long, default_value = "anonymous")]
        author: String,
    },

    /// A bare request for generated answers.
    Request {
        #[command(flatten)]
        log: LogArgs,
        /// Question id.
        #[arg(long)]
        question_id: i64,
        /// Question text.
        #[arg(long)]
        text: String,
    },
}

/// Arguments for `askbus dead-letters`.
#[derive(Args, Debug)]
pub struct DeadLetterArgs {
    #[command(flatten)]
    pub log: LogArgs,

    /// Source stream whose dead letters are shown.
    #[arg(long, default_value = DEFAULT_GENERATION_STREAM)]
    pub stream: String,

    /// Consumer group whose pending count is reported.
    #[arg(long, default_value = DEFAULT_GENERATION_GROUP)]
    pub group: String,

    /// Maximum number of dead letters to print.
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Relay(args) => run_relay_command(args).await,
        Commands::Worker(args) => run_worker_command(*args).await,
        Commands::Publish(command) => run_publish_command(command).await,
        Commands::DeadLetters(args) => run_dead_letters_command(args).await,
    }
}

/// Resolves once the process receives Ctrl-C.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ============================================================================
// Consumer Processes
// ============================================================================

async fn run_relay_command(args: RelayArgs) -> anyhow::Result<()> {
    init_metrics()?;

    let log = Arc::new(RedisLog::connect(&args.log.redis_url).await?);
    let registry = Arc::new(SubscriptionRegistry::new());
    let relay_config = RelayConfig::default()
        .with_ping_interval(Duration::from_secs(args.ping_interval_secs))
        .with_queue_capacity(args.queue_capacity);
    let state = AppState::new(Arc::clone(&registry), relay_config);

    let mut consumer = Consumer::new(
        args.consumer.config(&args.stream, &args.group),
        log,
        Arc::new(NotificationRelay::new(registry)),
    );
    consumer.start()?;
    info!(
        stream = %args.stream,
        group = %args.group,
        consumer = %consumer.consumer_id(),
        listen = %args.listen,
        "Relay running"
    );

    let served = serve(args.listen, build_router(state.clone()), shutdown_signal()).await;

    state.close_connections();
    consumer.shutdown().await?;
    served?;

    let stats = consumer.stats();
    info!(
        processed = stats.processed,
        dead_lettered = stats.dead_lettered,
        recoveries = stats.recoveries,
        "Relay stopped"
    );
    Ok(())
}

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    init_metrics()?;

    let log = Arc::new(RedisLog::connect(&args.log.redis_url).await?);
    let store = Arc::new(PgAnswerStore::connect(&args.database_url).await?);

    let mut inference_config = InferenceConfig::new(&args.inference_url);
    if let Some(token) = args.inference_token {
        inference_config = inference_config.with_token(token);
    }
    if let Some(secs) = args.inference_timeout_secs {
        inference_config = inference_config.with_timeout(Duration::from_secs(secs));
    }
    let inference = Arc::new(HttpInference::new(inference_config)?);

    let generation_config = GenerationConfig::default()
        .with_candidates(args.candidates)
        .with_notify(!args.no_notify);
    let producer = EventProducer::new(log.clone()).with_relay_stream(&args.relay_stream);
    let worker = GenerationWorker::new(generation_config, inference, store).with_producer(producer);

    let mut consumer = Consumer::new(
        args.consumer.config(&args.stream, &args.group),
        log,
        Arc::new(worker),
    );
    consumer.start()?;
    info!(
        stream = %args.stream,
        group = %args.group,
        consumer = %consumer.consumer_id(),
        inference_url = %args.inference_url,
        "Generation worker running"
    );

    let served = serve(args.listen, build_ops_router(), shutdown_signal()).await;

    consumer.shutdown().await?;
    served?;

    let stats = consumer.stats();
    info!(
        processed = stats.processed,
        failed = stats.failed,
        dead_lettered = stats.dead_lettered,
        "Generation worker stopped"
    );
    Ok(())
}

// ============================================================================
// One-shot Commands
// ============================================================================

/// Result of one append, as printed by `askbus publish`.
#[derive(Debug, Serialize)]
struct PublishOutput {
    stream: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl PublishOutput {
    fn new<E: std::fmt::Display>(stream: &str, result: Result<String, E>) -> Self {
        let (entry_id, error) = match result {
            Ok(id) => (Some(id), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Self {
            stream: stream.to_string(),
            entry_id,
            error,
        }
    }
}

/// Both halves of a new question's publication, reported independently.
fn question_outputs(producer: &EventProducer, outcome: PublishOutcome) -> Vec<PublishOutput> {
    vec![
        PublishOutput::new(producer.relay_stream(), outcome.relay),
        PublishOutput::new(producer.generation_stream(), outcome.generation),
    ]
}

fn entity_fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

async fn run_publish_command(command: PublishCommand) -> anyhow::Result<()> {
    let outputs = match command {
        PublishCommand::Question {
            log,
            id,
            course_id,
            text,
        } => {
            let producer = EventProducer::new(Arc::new(RedisLog::connect(&log.redis_url).await?));
            let question = QuestionData {
                course_id: EntityId::parse(&course_id),
                fields: entity_fields(&[("id", id.into()), ("question", text.clone().into())]),
            };

            let outcome = producer.question_created(question, &text).await;
            question_outputs(&producer, outcome)
        }
        PublishCommand::Answer {
            log,
            id,
            question_id,
            text,
            author,
        } => {
            let producer = EventProducer::new(Arc::new(RedisLog::connect(&log.redis_url).await?));
            let answer = AnswerData {
                question_id: EntityId::parse(&question_id),
                fields: entity_fields(&[
                    ("id", id.into()),
                    ("user_uuid", author.into()),
                    ("answer", text.into()),
                ]),
            };

            let result = producer.answer_created(answer).await;
            vec![PublishOutput::new(producer.relay_stream(), result)]
        }
        PublishCommand::Request {
            log,
            question_id,
            text,
        } => {
            let producer = EventProducer::new(Arc::new(RedisLog::connect(&log.redis_url).await?));
            let result = producer
                .request_answers(&AnswerRequest::new(question_id, text))
                .await;
            vec![PublishOutput::new(producer.generation_stream(), result)]
        }
    };

    println!("{}", serde_json::to_string_pretty(&outputs)?);

    let failed = outputs.iter().filter(|o| o.error.is_some()).count();
    if failed > 0 {
        anyhow::bail!("{} of {} appends failed", failed, outputs.len());
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct DeadLetterOutput {
    stream: String,
    pending: usize,
    dead_letters: Vec<Value>,
}

async fn run_dead_letters_command(args: DeadLetterArgs) -> anyhow::Result<()> {
    let log = RedisLog::connect(&args.log.redis_url).await?;
    let dead_letter = dead_letter_stream(&args.stream);

    let entries = log.range(&dead_letter, args.count).await?;
    let pending = match log.pending_count(&args.stream, &args.group).await {
        Ok(count) => count,
        Err(e) if e.is_missing_group() => 0,
        Err(e) => return Err(e.into()),
    };

    let dead_letters = entries
        .into_iter()
        .map(|entry| {
            serde_json::from_str(&entry.payload).unwrap_or_else(|_| Value::String(entry.payload))
        })
        .collect();

    let output = DeadLetterOutput {
        stream: dead_letter,
        pending,
        dead_letters,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
