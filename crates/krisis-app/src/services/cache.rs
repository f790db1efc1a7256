//! Cache-aside accessor shared by the search and parse adapters.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::services::store::KvStore;

/// Read through the cache before performing an expensive operation.
///
/// A fresh entry makes the call side-effect-free: the fetch closure is not
/// invoked at all on a hit. An unreachable or corrupt cache must never abort
/// the logical operation, so store failures on either the read or the write
/// degrade to a miss with a warning; only the fetch itself can fail the call.
pub async fn fetch_through<S, T, E, F, Fut>(
    store: &S,
    key: &str,
    ttl: Duration,
    fetch: F,
) -> Result<T, E>
where
    S: KvStore,
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    match store.get(key).await {
        Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
            Ok(value) => {
                tracing::debug!(%key, "cache hit");
                return Ok(value);
            }
            Err(error) => {
                tracing::warn!(%key, %error, "discarding corrupt cache entry");
            }
        },
        Ok(None) => {}
        Err(error) => {
            tracing::warn!(%key, %error, "cache read failed; falling through to fetch");
        }
    }

    let value = fetch().await?;

    match serde_json::to_string(&value) {
        Ok(raw) => {
            if let Err(error) = store.set_ex(key, &raw, ttl).await {
                tracing::warn!(%key, %error, "cache write failed; returning uncached value");
            }
        }
        Err(error) => {
            tracing::warn!(%key, %error, "failed to serialize value for cache");
        }
    }

    Ok(value)
}
