//! Task result store.
//!
//! Maps a task id to its terminal analysis outcome with a bounded lifetime.
//! Results are single-delivery: `take` removes the entry it returns, so the
//! first poll that observes a terminal state consumes it and a later poll for
//! the same id reports nothing. Unpolled entries expire on their own.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::services::analysis::ChatCompletion;
use crate::services::store::{KvStore, StoreError};

const TASK_KEY_PREFIX: &str = "task:";

#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Failure marker persisted in place of a result so a poll sees a
/// deterministic failure instead of hanging forever.
#[derive(Debug, Serialize, Deserialize)]
struct FailureRecord {
    error: bool,
    message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Value),
    Failed(String),
}

#[derive(Clone)]
pub struct TaskStore<S> {
    store: S,
    ttl: Duration,
}

impl<S: KvStore> TaskStore<S> {
    pub fn new(store: S, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn complete(
        &self,
        task_id: &str,
        result: &ChatCompletion,
    ) -> Result<(), TaskStoreError> {
        let raw = serde_json::to_string(result)?;
        self.store.set_ex(&task_key(task_id), &raw, self.ttl).await?;
        Ok(())
    }

    pub async fn fail(&self, task_id: &str, message: &str) -> Result<(), TaskStoreError> {
        let record = FailureRecord {
            error: true,
            message: message.to_string(),
        };
        let raw = serde_json::to_string(&record)?;
        self.store.set_ex(&task_key(task_id), &raw, self.ttl).await?;
        Ok(())
    }

    /// Return and consume the stored outcome for `task_id`, if any.
    pub async fn take(&self, task_id: &str) -> Result<Option<TaskOutcome>, TaskStoreError> {
        let key = task_key(task_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };

        let value: Value = serde_json::from_str(&raw)?;
        self.store.del(&key).await?;

        let failure = value
            .get("error")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if failure {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("analysis failed")
                .to_string();
            return Ok(Some(TaskOutcome::Failed(message)));
        }

        Ok(Some(TaskOutcome::Completed(value)))
    }
}

fn task_key(task_id: &str) -> String {
    format!("{TASK_KEY_PREFIX}{task_id}")
}
