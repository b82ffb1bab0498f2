//! Entity services.
//!
//! Reads go cache first and fall back to the remote store on a miss, caching
//! what comes back. A stale hit is returned as-is and refreshed in the
//! background. Writes never call the remote directly: they are queued through
//! the `SyncService` and reflected in the cache right away.

mod activity;
mod challenge;
mod profile;

pub use activity::ActivityService;
pub use challenge::ChallengeService;
pub use profile::ProfileService;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::cache::CacheManager;
use crate::error::Result;
use crate::remote::RemoteError;

/// Cache-aside read of `key`.
///
/// `fetch` is only polled on a miss, or in a background task when the hit is
/// stale and no other refresh of `key` is running.
pub(crate) async fn read_through<T, F, Fut>(
    cache: &Arc<CacheManager>,
    key: String,
    ttl: Option<Duration>,
    fetch: F,
) -> Result<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, RemoteError>> + Send + 'static,
{
    if let Some(cached) = cache.get::<T>(&key).await {
        if cached.is_stale {
            spawn_refresh(cache.clone(), key, ttl, fetch());
        }
        return Ok(cached.data);
    }

    let data = fetch().await?;
    store(cache, &key, &data, ttl).await;
    Ok(data)
}

/// Refresh `key` in the background unless a refresh is already in flight.
pub(crate) fn spawn_refresh<T, Fut>(
    cache: Arc<CacheManager>,
    key: String,
    ttl: Option<Duration>,
    fetch: Fut,
) where
    T: Serialize + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, RemoteError>> + Send + 'static,
{
    if !cache.begin_refresh(&key) {
        debug!(key = %key, "Refresh already running");
        return;
    }
    tokio::spawn(async move {
        match fetch.await {
            Ok(data) => store(&cache, &key, &data, ttl).await,
            Err(e) => debug!(key = %key, error = %e, "Background refresh failed, keeping stale entry"),
        }
        cache.finish_refresh(&key);
    });
}

/// Cache write that never fails the caller.
pub(crate) async fn store<T: Serialize + ?Sized>(
    cache: &CacheManager,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) {
    if let Err(e) = cache.set(key, value, ttl).await {
        debug!(key = key, error = %e, "Failed to cache value");
    }
}

pub(crate) fn decode<T: DeserializeOwned>(value: Value) -> std::result::Result<T, RemoteError> {
    serde_json::from_value(value).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
}

pub(crate) fn decode_rows<T: DeserializeOwned>(
    rows: Vec<Value>,
) -> std::result::Result<Vec<T>, RemoteError> {
    rows.into_iter().map(decode).collect()
}
