//! Background analysis worker.
//!
//! Processes one job at a time per worker instance. All job failures are
//! caught and accounted against the job's attempt budget; nothing a job does
//! can take the worker loop down. Submission and polling are decoupled from
//! this loop entirely through the shared store, so either side can restart
//! without losing task state within the expiry window.

use std::time::Duration;

use tokio::sync::watch;

use crate::services::analysis::{AnalysisClient, CompletionApi};
use crate::services::queue::{AnalysisQueue, Disposition, JobRecord, QueueError, current_timestamp_ms};
use crate::services::store::KvStore;
use crate::services::tasks::TaskStore;

pub struct Worker<S, A> {
    queue: AnalysisQueue<S>,
    tasks: TaskStore<S>,
    analysis: AnalysisClient<A>,
    poll_interval: Duration,
}

impl<S: KvStore, A: CompletionApi> Worker<S, A> {
    pub fn new(
        queue: AnalysisQueue<S>,
        tasks: TaskStore<S>,
        analysis: AnalysisClient<A>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            tasks,
            analysis,
            poll_interval,
        }
    }

    /// Consume jobs until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("analysis worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(error) = self.tick().await {
                tracing::error!(%error, "worker pass failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("analysis worker stopped");
    }

    /// One worker pass: promote due retries, then drain the pending list.
    pub async fn tick(&self) -> Result<(), QueueError> {
        self.queue.promote_due(current_timestamp_ms()).await?;
        while let Some(mut job) = self.queue.next_job().await? {
            self.process(&mut job).await;
        }
        Ok(())
    }

    async fn process(&self, job: &mut JobRecord) {
        tracing::info!(task_id = %job.task_id, attempt = job.attempts + 1, "processing analysis task");

        match self.analysis.analyze(&job.content).await {
            Ok(result) => {
                if let Err(error) = self.tasks.complete(&job.task_id, &result).await {
                    // The result is lost if we cannot write it; burn an
                    // attempt so the job is re-run rather than dropped.
                    tracing::error!(task_id = %job.task_id, %error, "failed to persist analysis result");
                    self.record_failure(job, &error.to_string()).await;
                    return;
                }
                if let Err(error) = self.queue.complete(job).await {
                    tracing::warn!(task_id = %job.task_id, %error, "failed to drop completed job record");
                }
                tracing::info!(task_id = %job.task_id, "completed analysis task");
            }
            Err(error) => {
                tracing::error!(task_id = %job.task_id, %error, "analysis task attempt failed");
                self.record_failure(job, &error.to_string()).await;
            }
        }
    }

    async fn record_failure(&self, job: &mut JobRecord, message: &str) {
        match self
            .queue
            .retry_or_fail(job, message, current_timestamp_ms())
            .await
        {
            Ok(Disposition::Retried { delay }) => {
                tracing::warn!(
                    task_id = %job.task_id,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying analysis task"
                );
            }
            Ok(Disposition::Exhausted) => {
                tracing::error!(
                    task_id = %job.task_id,
                    attempts = job.attempts,
                    "analysis task failed permanently"
                );
                if let Err(error) = self.tasks.fail(&job.task_id, message).await {
                    tracing::error!(task_id = %job.task_id, %error, "failed to persist failure record");
                }
            }
            Err(error) => {
                tracing::error!(task_id = %job.task_id, %error, "failed to record job failure");
            }
        }
    }
}
