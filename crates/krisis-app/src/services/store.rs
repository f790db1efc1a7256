//! Shared key-value store client.
//!
//! Everything stateful in the pipeline lives behind the `KvStore` seam: cache
//! entries, task results, job records, queue lists, and rate-limit counters.
//! Correctness relies on the store's per-key atomicity only; there is no
//! application-level locking and no cross-key transaction.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store command failed: {0}")]
    Redis(#[from] redis::RedisError),
}

#[async_trait]
pub trait KvStore: Clone + Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// Store `value` under `key`, overwriting any prior value, expiring after
    /// `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
    /// Returns whether a value was actually removed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;
    /// Increment the counter at `key`, starting its expiry window on the
    /// first hit, and return the count within the current window.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, StoreError>;
    async fn push_back(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn pop_front(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// Prepend `value`, keeping only the most recent `max_len` entries.
    async fn push_capped(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError>;
    /// Record `member` as runnable at `run_at_ms` (unix milliseconds).
    async fn schedule(&self, key: &str, member: &str, run_at_ms: i64) -> Result<(), StoreError>;
    /// Remove and return the members due at or before `now_ms`. A member is
    /// only returned to the single caller that wins its removal, so multiple
    /// workers can poll the same schedule safely.
    async fn take_due(&self, key: &str, now_ms: i64) -> Result<Vec<String>, StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, value, seconds).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.incr(key, 1).await?;
        if count == 1 {
            let _: bool = conn.expire(key, window.as_secs().max(1) as i64).await?;
        }
        Ok(count.max(0) as u64)
    }

    async fn push_back(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(key, value).await?;
        Ok(())
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.lpop(key, None).await?;
        Ok(value)
    }

    async fn push_capped(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let last = max_len.saturating_sub(1) as isize;
        let _: () = redis::pipe()
            .lpush(key, value)
            .ltrim(key, 0, last)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn schedule(&self, key: &str, member: &str, run_at_ms: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, run_at_ms).await?;
        Ok(())
    }

    async fn take_due(&self, key: &str, now_ms: i64) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn.zrangebyscore(key, "-inf", now_ms).await?;
        let mut taken = Vec::with_capacity(due.len());
        for member in due {
            // ZREM is atomic per member; only the caller that removes the
            // entry gets to run it.
            let removed: i64 = conn.zrem(key, &member).await?;
            if removed == 1 {
                taken.push(member);
            }
        }
        Ok(taken)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// In-process store with the same semantics, used by tests and local
/// development without a Redis instance. Expiry is tracked with `Instant` and
/// honored lazily on access.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<tokio::sync::Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    values: HashMap<String, (String, Instant)>,
    counters: HashMap<String, (u64, Instant)>,
    lists: HashMap<String, VecDeque<String>>,
    schedules: HashMap<String, Vec<(i64, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.values.get(key) {
            Some((value, deadline)) if *deadline > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                inner.values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .values
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.values.remove(key).is_some())
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let entry = inner
            .counters
            .entry(key.to_string())
            .or_insert((0, now + window));
        if entry.1 <= now {
            *entry = (0, now + window);
        }
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn push_back(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.lists.get_mut(key).and_then(VecDeque::pop_front))
    }

    async fn push_capped(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let list = inner.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        list.truncate(max_len);
        Ok(())
    }

    async fn schedule(&self, key: &str, member: &str, run_at_ms: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let entries = inner.schedules.entry(key.to_string()).or_default();
        entries.retain(|(_, existing)| existing != member);
        entries.push((run_at_ms, member.to_string()));
        entries.sort_by_key(|(score, _)| *score);
        Ok(())
    }

    async fn take_due(&self, key: &str, now_ms: i64) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(entries) = inner.schedules.get_mut(key) else {
            return Ok(Vec::new());
        };
        let mut due = Vec::new();
        entries.retain(|(score, member)| {
            if *score <= now_ms {
                due.push(member.clone());
                false
            } else {
                true
            }
        });
        Ok(due)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
