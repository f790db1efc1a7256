//! Analysis job queue.
//!
//! Job state lives entirely in the shared store: a pending list dequeued by
//! workers, a schedule of delayed retries, and one record per job keyed by
//! its task id. Any number of worker processes can share the queue because
//! handoff happens through the store's atomic list pop and schedule removal.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::QueueConfig;
use crate::services::store::{KvStore, StoreError};

const PENDING_KEY: &str = "queue:analysis:pending";
const DELAYED_KEY: &str = "queue:analysis:delayed";
const FAILED_KEY: &str = "queue:analysis:failed";
const JOB_KEY_PREFIX: &str = "job:";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue store error: {0}")]
    Store(#[from] StoreError),
    #[error("corrupt job record: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
    Failed,
}

/// One queued unit of work, bound 1:1 to a task by the task id it carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub task_id: String,
    pub content: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub last_error: Option<String>,
}

impl JobRecord {
    fn new(task_id: &str, content: &str, max_attempts: u32) -> Self {
        let now_ms = current_timestamp_ms();
        Self {
            task_id: task_id.to_string(),
            content: content.to_string(),
            state: JobState::Queued,
            attempts: 0,
            max_attempts,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            last_error: None,
        }
    }
}

/// What happened to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retried { delay: Duration },
    Exhausted,
}

#[derive(Clone)]
pub struct AnalysisQueue<S> {
    store: S,
    cfg: QueueConfig,
    job_ttl: Duration,
}

impl<S: KvStore> AnalysisQueue<S> {
    pub fn new(store: S, cfg: QueueConfig, job_ttl: Duration) -> Self {
        debug_assert!(cfg.max_attempts > 0);
        Self {
            store,
            cfg,
            job_ttl,
        }
    }

    /// Enqueue a job for `task_id`. Returns as soon as the job is durably
    /// recorded; an enqueue failure propagates rather than being dropped.
    pub async fn enqueue(&self, task_id: &str, content: &str) -> Result<(), QueueError> {
        let record = JobRecord::new(task_id, content, self.cfg.max_attempts);
        self.save(&record).await?;
        self.store.push_back(PENDING_KEY, task_id).await?;
        tracing::info!(%task_id, "added analysis task to queue");
        Ok(())
    }

    /// Current queue state of the job bound to `task_id`, if the job record
    /// still exists. A job waiting on retry backoff reports `Queued`.
    pub async fn job_state(&self, task_id: &str) -> Result<Option<JobState>, QueueError> {
        let Some(raw) = self.store.get(&job_key(task_id)).await? else {
            return Ok(None);
        };
        let record: JobRecord = serde_json::from_str(&raw)?;
        Ok(Some(record.state))
    }

    /// Move delayed jobs whose backoff has elapsed back onto the pending
    /// list. Returns how many were promoted.
    pub async fn promote_due(&self, now_ms: i64) -> Result<usize, QueueError> {
        let due = self.store.take_due(DELAYED_KEY, now_ms).await?;
        let count = due.len();
        for task_id in due {
            self.store.push_back(PENDING_KEY, &task_id).await?;
        }
        Ok(count)
    }

    /// Dequeue the next runnable job and mark it active. Dangling ids whose
    /// record has already expired are skipped.
    pub async fn next_job(&self) -> Result<Option<JobRecord>, QueueError> {
        while let Some(task_id) = self.store.pop_front(PENDING_KEY).await? {
            let Some(raw) = self.store.get(&job_key(&task_id)).await? else {
                tracing::warn!(%task_id, "dropping queue entry with no job record");
                continue;
            };
            let mut record: JobRecord = serde_json::from_str(&raw)?;
            record.state = JobState::Active;
            record.updated_at_ms = current_timestamp_ms();
            self.save(&record).await?;
            return Ok(Some(record));
        }
        Ok(None)
    }

    /// Drop the record of a successfully completed job; the task store holds
    /// the result from here on.
    pub async fn complete(&self, record: &JobRecord) -> Result<(), QueueError> {
        self.store.del(&job_key(&record.task_id)).await?;
        Ok(())
    }

    /// Account a failed attempt: schedule a retry with exponential backoff
    /// while attempts remain, otherwise mark the job failed and retain its id
    /// for diagnostics.
    pub async fn retry_or_fail(
        &self,
        record: &mut JobRecord,
        error_message: &str,
        now_ms: i64,
    ) -> Result<Disposition, QueueError> {
        record.attempts += 1;
        record.last_error = Some(error_message.to_string());
        record.updated_at_ms = current_timestamp_ms();

        if record.attempts < record.max_attempts {
            record.state = JobState::Queued;
            self.save(record).await?;
            let delay = self.backoff_delay(record.attempts);
            let run_at_ms = now_ms + delay.as_millis() as i64;
            self.store
                .schedule(DELAYED_KEY, &record.task_id, run_at_ms)
                .await?;
            Ok(Disposition::Retried { delay })
        } else {
            record.state = JobState::Failed;
            self.save(record).await?;
            self.store
                .push_capped(FAILED_KEY, &record.task_id, self.cfg.failed_retention)
                .await?;
            Ok(Disposition::Exhausted)
        }
    }

    /// Base delay doubled per prior attempt: 5s before the second attempt,
    /// 10s before the third with the default base.
    fn backoff_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        Duration::from_millis(self.cfg.backoff_base_ms.saturating_mul(1u64 << exponent))
    }

    async fn save(&self, record: &JobRecord) -> Result<(), QueueError> {
        let raw = serde_json::to_string(record)?;
        self.store
            .set_ex(&job_key(&record.task_id), &raw, self.job_ttl)
            .await?;
        Ok(())
    }
}

fn job_key(task_id: &str) -> String {
    format!("{JOB_KEY_PREFIX}{task_id}")
}

pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::MemoryStore;

    fn queue() -> AnalysisQueue<MemoryStore> {
        AnalysisQueue::new(
            MemoryStore::new(),
            QueueConfig::default(),
            Duration::from_secs(24 * 60 * 60),
        )
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_marks_the_job_active() {
        let queue = queue();
        queue.enqueue("t-1", "article body").await.expect("enqueue succeeds");

        assert_eq!(
            queue.job_state("t-1").await.expect("state readable"),
            Some(JobState::Queued)
        );

        let job = queue
            .next_job()
            .await
            .expect("dequeue succeeds")
            .expect("job available");
        assert_eq!(job.task_id, "t-1");
        assert_eq!(job.content, "article body");
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts, 0);

        assert_eq!(
            queue.job_state("t-1").await.expect("state readable"),
            Some(JobState::Active)
        );
        assert!(queue.next_job().await.expect("dequeue succeeds").is_none());
    }

    #[tokio::test]
    async fn failed_attempts_back_off_exponentially_before_exhausting() {
        let queue = queue();
        queue.enqueue("t-2", "body").await.expect("enqueue succeeds");
        let mut job = queue
            .next_job()
            .await
            .expect("dequeue succeeds")
            .expect("job available");
        let now_ms = current_timestamp_ms();

        let first = queue
            .retry_or_fail(&mut job, "timeout", now_ms)
            .await
            .expect("retry recorded");
        assert_eq!(
            first,
            Disposition::Retried {
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(
            queue.job_state("t-2").await.expect("state readable"),
            Some(JobState::Queued)
        );

        // Not due yet: nothing promotes before the backoff elapses.
        assert_eq!(queue.promote_due(now_ms).await.expect("promote runs"), 0);
        assert_eq!(
            queue.promote_due(now_ms + 5_000).await.expect("promote runs"),
            1
        );

        let mut job = queue
            .next_job()
            .await
            .expect("dequeue succeeds")
            .expect("job available");
        assert_eq!(job.attempts, 1);

        let second = queue
            .retry_or_fail(&mut job, "timeout", now_ms)
            .await
            .expect("retry recorded");
        assert_eq!(
            second,
            Disposition::Retried {
                delay: Duration::from_secs(10)
            }
        );

        assert_eq!(
            queue.promote_due(now_ms + 15_000).await.expect("promote runs"),
            1
        );
        let mut job = queue
            .next_job()
            .await
            .expect("dequeue succeeds")
            .expect("job available");

        let third = queue
            .retry_or_fail(&mut job, "timeout", now_ms)
            .await
            .expect("failure recorded");
        assert_eq!(third, Disposition::Exhausted);
        assert_eq!(job.attempts, 3);
        assert_eq!(
            queue.job_state("t-2").await.expect("state readable"),
            Some(JobState::Failed)
        );
        assert!(queue.next_job().await.expect("dequeue succeeds").is_none());
    }

    #[tokio::test]
    async fn completion_drops_the_job_record() {
        let queue = queue();
        queue.enqueue("t-3", "body").await.expect("enqueue succeeds");
        let job = queue
            .next_job()
            .await
            .expect("dequeue succeeds")
            .expect("job available");

        queue.complete(&job).await.expect("completion recorded");
        assert_eq!(queue.job_state("t-3").await.expect("state readable"), None);
    }

    #[tokio::test]
    async fn dangling_pending_entries_are_skipped() {
        let queue = queue();
        queue.enqueue("t-4", "body").await.expect("enqueue succeeds");
        queue.enqueue("t-5", "body").await.expect("enqueue succeeds");

        // Simulate t-4's record expiring before a worker reaches it.
        queue.store.del("job:t-4").await.expect("del succeeds");

        let job = queue
            .next_job()
            .await
            .expect("dequeue succeeds")
            .expect("job available");
        assert_eq!(job.task_id, "t-5");
    }
}
