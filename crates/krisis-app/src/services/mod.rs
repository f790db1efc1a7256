pub mod analysis;
pub mod cache;
pub mod extract;
pub mod news;
pub mod queue;
pub mod store;
pub mod tasks;
pub mod worker;

pub use analysis::{AnalysisClient, AnalysisError, ChatCompletion, CompletionApi, HttpCompletionApi};
pub use extract::{ExtractClient, ExtractError};
pub use news::{NewsClient, NewsError};
pub use queue::{AnalysisQueue, JobState, QueueError};
pub use store::{KvStore, MemoryStore, RedisStore, StoreError};
pub use tasks::{TaskOutcome, TaskStore};
pub use worker::Worker;
