//! In-memory answer store.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{Answer, AnswerStore};
use crate::error::StoreError;

/// Keeps inserted answers in a vector, assigning sequential ids from 1.
#[derive(Debug, Default)]
pub struct MemoryAnswerStore {
    rows: Mutex<Vec<Answer>>,
}

impl MemoryAnswerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every stored answer in insertion order.
    pub fn answers(&self) -> Vec<Answer> {
        self.lock().clone()
    }

    /// Returns the answers attached to one question.
    pub fn answers_for(&self, question_id: i64) -> Vec<Answer> {
        self.lock()
            .iter()
            .filter(|a| a.question_id == question_id)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Answer>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AnswerStore for MemoryAnswerStore {
    async fn create_answer(
        &self,
        question_id: i64,
        author: &str,
        text: &str,
    ) -> Result<Answer, StoreError> {
        let mut rows = self.lock();
        let answer = Answer {
            id: rows.len() as i64 + 1,
            question_id,
            user_uuid: author.to_string(),
            answer: text.to_string(),
            created_at: Utc::now(),
        };
        rows.push(answer.clone());
        Ok(answer)
    }
}
