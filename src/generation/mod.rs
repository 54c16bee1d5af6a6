//! Generation workers: answer requests in, machine-generated answers out.
//!
//! ```text
//! answers:requests ──► Consumer ──► GenerationWorker ──► InferenceClient (×3)
//!                                          │
//!                                          ├──► AnswerStore::create_answer
//!                                          └──► EventProducer::answer_created ──► events:relay
//! ```

pub mod inference;
pub mod worker;

pub use inference::{parse_generated_text, HttpInference, InferenceClient, InferenceConfig};
pub use worker::{GenerationConfig, GenerationWorker, DEFAULT_CANDIDATES};
