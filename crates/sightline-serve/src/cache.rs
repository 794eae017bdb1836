//! In-memory response caching with moka.
//!
//! The snapshot refresher writes the current pins here on every tick, and
//! request handlers read through [`get_or_compute`], computing from the store
//! only when the refresher has not run yet or the entry has expired.
//!
//! Only the refreshed pins are cached, under [`PINS_KEY`] (`pins:latest`).

use std::future::Future;
use std::time::Duration;

use moka::future::Cache;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::ApiError;

/// Default cache capacity (number of entries).
pub const DEFAULT_CACHE_CAPACITY: u64 = 1000;

/// Key of the pins entry maintained by the snapshot refresher.
pub const PINS_KEY: &str = "pins:latest";

/// Cached response with metadata.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    /// Serialized JSON response.
    pub json: String,
    /// When this entry was cached.
    pub cached_at: chrono::DateTime<chrono::Utc>,
}

pub type ResponseCache = Cache<String, CachedEntry>;

/// Create a response cache whose entries live for `ttl`.
pub fn new_cache(ttl: Duration) -> ResponseCache {
    Cache::builder()
        .max_capacity(DEFAULT_CACHE_CAPACITY)
        .time_to_live(ttl)
        .build()
}

/// Serialize `value` into the cache under `key`.
pub async fn store<T: Serialize>(cache: &ResponseCache, key: &str, value: &T) -> Result<(), ApiError> {
    let json = serde_json::to_string(value)?;
    cache
        .insert(
            key.to_string(),
            CachedEntry {
                json,
                cached_at: chrono::Utc::now(),
            },
        )
        .await;
    Ok(())
}

/// Get a cached value or compute and cache it.
pub async fn get_or_compute<T, F, Fut>(
    cache: &ResponseCache,
    key: &str,
    compute: F,
) -> Result<T, ApiError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    if let Some(entry) = cache.get(key).await {
        match serde_json::from_str(&entry.json) {
            Ok(value) => {
                tracing::debug!(key = %key, cached_at = %entry.cached_at, "cache hit");
                return Ok(value);
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to deserialize cached entry");
            }
        }
    }

    tracing::debug!(key = %key, "cache miss, computing");
    let value = compute().await?;

    if let Err(e) = store(cache, key, &value).await {
        tracing::warn!(key = %key, error = %e, "failed to serialize for cache");
    }

    Ok(value)
}
