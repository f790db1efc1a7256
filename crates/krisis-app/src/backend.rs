//! Wires the services into the HTTP layer's backend seams.

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use krisis_server::{
    BackendError, NewsBackend, RateCounterError, RateCounterStore, SearchOutcome, TaskStatus,
};

use crate::config::AppConfig;
use crate::services::extract::{ExtractClient, ExtractError};
use crate::services::news::{self, NewsClient, NewsError};
use crate::services::queue::{AnalysisQueue, JobState};
use crate::services::store::KvStore;
use crate::services::tasks::{TaskOutcome, TaskStore};

const HEALTH_PROBE_KEY: &str = "health-check";

pub struct Backend<S: KvStore> {
    store: S,
    news: NewsClient<S>,
    extract: ExtractClient<S>,
    queue: AnalysisQueue<S>,
    tasks: TaskStore<S>,
}

impl<S: KvStore> Backend<S> {
    pub fn new(store: S, cfg: &AppConfig) -> Result<Self, BackendError> {
        let news = NewsClient::new(store.clone(), cfg.news.clone(), &cfg.cache)
            .map_err(|err| BackendError::upstream(err.to_string()))?;
        let extract = ExtractClient::new(store.clone(), cfg.extract.clone(), &cfg.cache)
            .map_err(|err| BackendError::upstream(err.to_string()))?;
        let result_ttl = Duration::from_secs(cfg.cache.analysis_ttl_secs);
        let queue = AnalysisQueue::new(store.clone(), cfg.queue.clone(), result_ttl);
        let tasks = TaskStore::new(store.clone(), result_ttl);
        Ok(Self {
            store,
            news,
            extract,
            queue,
            tasks,
        })
    }

    pub fn queue(&self) -> &AnalysisQueue<S> {
        &self.queue
    }

    pub fn tasks(&self) -> &TaskStore<S> {
        &self.tasks
    }
}

#[async_trait]
impl<S: KvStore> NewsBackend for Backend<S> {
    async fn search(&self, query: &str) -> Result<SearchOutcome, BackendError> {
        let payload = self.news.search(query).await.map_err(map_news_error)?;
        let articles = news::normalize_articles(&payload.articles);
        let total_results = payload.total_results.unwrap_or(articles.len() as u64);
        Ok(SearchOutcome {
            articles,
            total_results,
        })
    }

    async fn parse(&self, url: &str) -> Result<String, BackendError> {
        self.extract.parse(url).await.map_err(map_extract_error)
    }

    async fn start_analysis(&self, content: &str) -> Result<String, BackendError> {
        let task_id = Uuid::new_v4().to_string();
        self.queue
            .enqueue(&task_id, content)
            .await
            .map_err(|err| BackendError::store(format!("Failed to queue analysis: {err}")))?;
        Ok(task_id)
    }

    async fn check_analysis(&self, task_id: &str) -> Result<TaskStatus, BackendError> {
        let outcome = self.tasks.take(task_id).await.map_err(|err| {
            BackendError::store(format!("Failed to check analysis status: {err}"))
        })?;
        match outcome {
            Some(TaskOutcome::Completed(result)) => {
                return Ok(TaskStatus::Completed { result });
            }
            Some(TaskOutcome::Failed(error)) => {
                return Ok(TaskStatus::Failed { error });
            }
            None => {}
        }

        let state = self.queue.job_state(task_id).await.map_err(|err| {
            BackendError::store(format!("Failed to check analysis status: {err}"))
        })?;
        Ok(match state {
            Some(JobState::Queued) => TaskStatus::Queued,
            Some(JobState::Active) => TaskStatus::Active,
            // Terminal job with no stored result: already consumed or expired.
            Some(JobState::Failed) | None => TaskStatus::NotFound,
        })
    }

    async fn store_healthy(&self) -> bool {
        self.store.get(HEALTH_PROBE_KEY).await.is_ok()
    }
}

fn map_news_error(error: NewsError) -> BackendError {
    let message = error.to_string();
    match error {
        NewsError::InvalidApiKey => BackendError::auth(message),
        NewsError::RateLimited => BackendError::upstream_rate_limit(message),
        NewsError::Timeout => BackendError::timeout(message),
        NewsError::Provider(_) | NewsError::Transport(_) => BackendError::upstream(message),
    }
}

fn map_extract_error(error: ExtractError) -> BackendError {
    let message = error.to_string();
    match error {
        ExtractError::Timeout => BackendError::timeout(message),
        ExtractError::EmptyContent | ExtractError::Upstream(_) => BackendError::upstream(message),
    }
}

/// Rate-limit counters living in the same shared store, so every server
/// process charges one logical budget.
pub struct StoreCounters<S>(pub S);

#[async_trait]
impl<S: KvStore> RateCounterStore for StoreCounters<S> {
    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, RateCounterError> {
        self.0
            .incr_window(key, window)
            .await
            .map_err(|err| RateCounterError(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::analysis::ChatCompletion;
    use crate::services::store::MemoryStore;

    fn backend() -> Backend<MemoryStore> {
        Backend::new(MemoryStore::new(), &AppConfig::default()).expect("backend builds")
    }

    fn completion() -> ChatCompletion {
        serde_json::from_value(serde_json::json!({
            "id": "cmpl-1",
            "model": "gpt-test",
            "choices": [{"message": {"role": "assistant", "content": "report"}}]
        }))
        .expect("completion parses")
    }

    #[tokio::test]
    async fn submission_is_visible_as_queued_before_any_worker_runs() {
        let backend = backend();
        let task_id = backend
            .start_analysis("article body")
            .await
            .expect("submission succeeds");

        assert_eq!(
            backend.check_analysis(&task_id).await.expect("poll succeeds"),
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn terminal_result_is_delivered_exactly_once() {
        let backend = backend();
        let task_id = backend
            .start_analysis("article body")
            .await
            .expect("submission succeeds");

        // Stand in for the worker: persist the result, drop the job record.
        let job = backend
            .queue()
            .next_job()
            .await
            .expect("dequeue succeeds")
            .expect("job available");
        backend
            .tasks()
            .complete(&task_id, &completion())
            .await
            .expect("result persists");
        backend.queue().complete(&job).await.expect("record dropped");

        match backend.check_analysis(&task_id).await.expect("poll succeeds") {
            TaskStatus::Completed { result } => {
                assert_eq!(result["choices"][0]["message"]["content"], "report");
            }
            other => panic!("expected completed, got {other:?}"),
        }

        assert_eq!(
            backend.check_analysis(&task_id).await.expect("poll succeeds"),
            TaskStatus::NotFound
        );
    }

    #[tokio::test]
    async fn failed_result_reports_failed_then_not_found() {
        let backend = backend();
        let task_id = backend
            .start_analysis("article body")
            .await
            .expect("submission succeeds");

        backend
            .tasks()
            .fail(&task_id, "Analysis failed after 3 attempts: timeout")
            .await
            .expect("failure persists");

        match backend.check_analysis(&task_id).await.expect("poll succeeds") {
            TaskStatus::Failed { error } => {
                assert_eq!(error, "Analysis failed after 3 attempts: timeout");
            }
            other => panic!("expected failed, got {other:?}"),
        }
        assert_eq!(
            backend.check_analysis(&task_id).await.expect("poll succeeds"),
            TaskStatus::NotFound
        );
    }

    #[tokio::test]
    async fn unknown_task_reports_not_found() {
        let backend = backend();
        assert_eq!(
            backend
                .check_analysis("6fa459ea-ee8a-4ca4-894e-db77e160355e")
                .await
                .expect("poll succeeds"),
            TaskStatus::NotFound
        );
    }

    #[tokio::test]
    async fn issued_task_ids_are_uuid_shaped_and_unique() {
        let backend = backend();
        let a = backend.start_analysis("x").await.expect("submission succeeds");
        let b = backend.start_analysis("x").await.expect("submission succeeds");
        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }
}
