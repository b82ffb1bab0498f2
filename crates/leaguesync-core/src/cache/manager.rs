use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::keys::matches_pattern;
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::storage::{load_json, save_json, Storage, StorageError, CACHE_KEY};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub data: T,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: u32,
}

impl<T> CacheEntry<T> {
    /// `ttl` must be positive so that `expires_at > timestamp`. `None` when the
    /// expiry falls outside the representable date range.
    pub fn new(data: T, now: DateTime<Utc>, ttl: chrono::Duration, version: u32) -> Option<Self> {
        let expires_at = now.checked_add_signed(ttl)?;
        Some(Self {
            data,
            timestamp: now,
            expires_at,
            version,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Inside the soft window before hard expiry: still served, but due a refresh.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_window: chrono::Duration) -> bool {
        now >= self.expires_at - stale_window
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_minutes()
    }

    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        let minutes = self.age_minutes(now);
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}

/// A cache hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub data: T,
    /// Served from inside the stale window; the caller should refresh in the background.
    pub is_stale: bool,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// TTL cache over JSON values, written through to durable storage on every change.
pub struct CacheManager {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry<Value>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
    refreshing: std::sync::Mutex<HashSet<String>>,
}

impl CacheManager {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        Self {
            storage,
            clock,
            config,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
            refreshing: std::sync::Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Replace in-memory entries with the persisted ones.
    ///
    /// Entries written by another cache-format version, entries that no longer
    /// parse, and entries that have already expired are dropped. Returns the number
    /// of entries kept.
    pub async fn load(&self) -> usize {
        let raw: HashMap<String, Value> = match load_json(self.storage.as_ref(), CACHE_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(error = %e, "Failed to load persisted cache, starting empty");
                HashMap::new()
            }
        };

        let now = self.clock.now();
        let total = raw.len();
        let loaded: HashMap<String, CacheEntry<Value>> = raw
            .into_iter()
            .filter_map(|(key, value)| {
                let entry: CacheEntry<Value> = serde_json::from_value(value).ok()?;
                (entry.version == self.config.version && !entry.is_expired(now))
                    .then_some((key, entry))
            })
            .collect();

        let kept = loaded.len();
        let mut entries = self.entries.lock().await;
        *entries = loaded;
        if kept != total {
            debug!(kept, dropped = total - kept, "Dropped outdated cache entries on load");
            self.persist_locked(&entries).await;
        }
        kept
    }

    /// Write all entries to durable storage.
    pub async fn persist(&self) -> std::result::Result<(), StorageError> {
        let entries = self.entries.lock().await;
        save_json(self.storage.as_ref(), CACHE_KEY, &*entries).await
    }

    /// Persistence failures are logged and otherwise ignored; memory stays authoritative.
    async fn persist_locked(&self, entries: &HashMap<String, CacheEntry<Value>>) {
        if let Err(e) = save_json(self.storage.as_ref(), CACHE_KEY, entries).await {
            warn!(error = %e, "Failed to persist cache");
        }
    }

    /// Cache `value` under `key`. `None` uses the configured default TTL.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        if ttl.is_zero() {
            return Err(Error::InvalidTtl);
        }
        let ttl = chrono::Duration::from_std(ttl).map_err(|_| Error::InvalidTtl)?;
        let data = serde_json::to_value(value)?;
        let entry = CacheEntry::new(data, self.clock.now(), ttl, self.config.version)
            .ok_or(Error::InvalidTtl)?;

        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), entry);
        self.persist_locked(&entries).await;
        debug!(key = key, "Cache set");
        Ok(())
    }

    /// Look up `key`. Returns `None` on a miss, after hard expiry, or when the
    /// cached value does not deserialize as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<Cached<T>> {
        let entries = self.entries.lock().await;
        self.lookup(&entries, key)
    }

    /// Look up several keys at once. Misses are simply absent from the result.
    pub async fn get_many<T, I, S>(&self, keys: I) -> HashMap<String, Cached<T>>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = self.entries.lock().await;
        keys.into_iter()
            .filter_map(|key| {
                let key = key.as_ref();
                self.lookup(&entries, key).map(|hit| (key.to_string(), hit))
            })
            .collect()
    }

    fn lookup<T: DeserializeOwned>(
        &self,
        entries: &HashMap<String, CacheEntry<Value>>,
        key: &str,
    ) -> Option<Cached<T>> {
        let now = self.clock.now();
        let hit = entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| match T::deserialize(&entry.data) {
                Ok(data) => Some(Cached {
                    data,
                    is_stale: entry.is_stale(now, self.stale_window()),
                    cached_at: entry.timestamp,
                    expires_at: entry.expires_at,
                }),
                Err(e) => {
                    debug!(key = key, error = %e, "Cached value has unexpected shape");
                    None
                }
            });

        match hit {
            Some(ref cached) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                if cached.is_stale {
                    self.stale_hits.fetch_add(1, Ordering::Relaxed);
                }
                debug!(key = key, stale = cached.is_stale, "Cache hit");
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = key, "Cache miss");
            }
        }
        hit
    }

    fn stale_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.stale_window()).unwrap_or(chrono::Duration::zero())
    }

    /// Remove every entry matching `pattern` (exact key, or a glob with `*`).
    pub async fn invalidate(&self, pattern: &str) -> usize {
        self.invalidate_all([pattern]).await
    }

    /// Remove every entry matching any of `patterns`, persisting once.
    pub async fn invalidate_all<I, S>(&self, patterns: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<S> = patterns.into_iter().collect();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|key, _| {
            !patterns
                .iter()
                .any(|pattern| matches_pattern(key, pattern.as_ref()))
        });
        let removed = before - entries.len();
        if removed > 0 {
            self.persist_locked(&entries).await;
            debug!(removed, "Cache invalidated");
        }
        removed
    }

    /// Drop hard-expired entries.
    pub async fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            self.persist_locked(&entries).await;
        }
        removed
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        entries.clear();
        self.persist_locked(&entries).await;
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Age of the entry under `key`, for "updated 5m ago" style labels.
    pub async fn age_display(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        entries.get(key).map(|entry| entry.age_display(now))
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            entries: self.len().await,
        }
    }

    /// Claim the background refresh of `key`. Returns `false` if one is already running.
    pub fn begin_refresh(&self, key: &str) -> bool {
        self.refreshing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string())
    }

    pub fn finish_refresh(&self, key: &str) {
        self.refreshing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn setup() -> (Arc<MemoryStorage>, Arc<ManualClock>, CacheManager) {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::default());
        let cache = CacheManager::new(storage.clone(), clock.clone(), CacheConfig::default());
        (storage, clock, cache)
    }

    #[tokio::test]
    async fn test_get_returns_value_until_ttl_elapses() {
        let (_, clock, cache) = setup();
        cache
            .set("k", &json!({"v": 1}), Some(Duration::from_millis(1000)))
            .await
            .unwrap();

        let hit: Cached<Value> = cache.get("k").await.unwrap();
        assert_eq!(hit.data, json!({"v": 1}));

        clock.advance(chrono::Duration::milliseconds(999));
        assert!(cache.get::<Value>("k").await.is_some());

        clock.advance(chrono::Duration::milliseconds(1));
        assert!(cache.get::<Value>("k").await.is_none());
    }

    #[tokio::test]
    async fn test_stale_window_flags_but_still_serves() {
        let (_, clock, cache) = setup();
        // default stale window is 1 minute
        cache
            .set("k", &"v", Some(Duration::from_secs(300)))
            .await
            .unwrap();

        let fresh: Cached<String> = cache.get("k").await.unwrap();
        assert!(!fresh.is_stale);

        clock.advance(chrono::Duration::seconds(250));
        let stale: Cached<String> = cache.get("k").await.unwrap();
        assert!(stale.is_stale);
        assert_eq!(stale.data, "v");

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.stale_hits, 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let (_, _, cache) = setup();
        let err = cache.set("k", &1, Some(Duration::ZERO)).await;
        assert!(matches!(err, Err(Error::InvalidTtl)));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_ttl_past_calendar_range_rejected() {
        let (_, _, cache) = setup();
        let err = cache
            .set("k", &1, Some(Duration::from_secs(10_000_000_000_000)))
            .await;
        assert!(matches!(err, Err(Error::InvalidTtl)));
        assert!(cache.get::<i32>("k").await.is_none());
    }

    #[tokio::test]
    async fn test_wrong_type_is_a_miss() {
        let (_, _, cache) = setup();
        cache.set("k", &"text", None).await.unwrap();
        assert!(cache.get::<Vec<u32>>("k").await.is_none());
        assert_eq!(cache.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn test_get_many_skips_misses() {
        let (_, _, cache) = setup();
        cache.set("profiles:a", &1, None).await.unwrap();
        cache.set("profiles:b", &2, None).await.unwrap();

        let hits = cache
            .get_many::<u32, _, _>(["profiles:a", "profiles:b", "profiles:c"])
            .await;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits["profiles:b"].data, 2);
        assert!(!hits.contains_key("profiles:c"));
    }

    #[tokio::test]
    async fn test_invalidate_pattern_cascades() {
        let (_, _, cache) = setup();
        cache.set("leaderboard:top:10", &1, None).await.unwrap();
        cache.set("leaderboard:top:50", &1, None).await.unwrap();
        cache.set("profiles:u1", &1, None).await.unwrap();

        assert_eq!(cache.invalidate("leaderboard:*").await, 2);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.invalidate("profiles:u1").await, 1);
        assert_eq!(cache.invalidate("profiles:u1").await, 0);
    }

    #[tokio::test]
    async fn test_entries_survive_reload() {
        let (storage, clock, cache) = setup();
        cache.set("k", &json!([1, 2, 3]), None).await.unwrap();

        let reloaded = CacheManager::new(storage, clock, CacheConfig::default());
        assert_eq!(reloaded.load().await, 1);
        let hit: Cached<Vec<u32>> = reloaded.get("k").await.unwrap();
        assert_eq!(hit.data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_load_drops_other_versions_and_expired() {
        let (storage, clock, cache) = setup();
        cache.set("short", &1, Some(Duration::from_secs(1))).await.unwrap();
        cache.set("long", &2, Some(Duration::from_secs(600))).await.unwrap();

        // Same version, after "short" has expired
        clock.advance(chrono::Duration::seconds(2));
        let same = CacheManager::new(storage.clone(), clock.clone(), CacheConfig::default());
        assert_eq!(same.load().await, 1);
        assert!(same.get::<u32>("long").await.is_some());

        // Bumped format version discards everything
        let bumped = CacheConfig {
            version: CacheConfig::default().version + 1,
            ..CacheConfig::default()
        };
        let newer = CacheManager::new(storage, clock, bumped);
        assert_eq!(newer.load().await, 0);
    }

    #[tokio::test]
    async fn test_load_tolerates_corrupt_blob() {
        let (storage, clock, _) = setup();
        storage.set(CACHE_KEY, "not json").await.unwrap();
        let cache = CacheManager::new(storage, clock, CacheConfig::default());
        assert_eq!(cache.load().await, 0);
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_memory_authoritative() {
        let (storage, _, cache) = setup();
        storage.set_fail_writes(true);
        cache.set("k", &1, None).await.unwrap();
        assert_eq!(cache.get::<u32>("k").await.unwrap().data, 1);
        assert!(!storage.contains(CACHE_KEY));
    }

    #[tokio::test]
    async fn test_cleanup_expired_and_clear() {
        let (_, clock, cache) = setup();
        cache.set("a", &1, Some(Duration::from_secs(1))).await.unwrap();
        cache.set("b", &1, Some(Duration::from_secs(100))).await.unwrap();
        clock.advance(chrono::Duration::seconds(5));

        assert_eq!(cache.cleanup_expired().await, 1);
        assert_eq!(cache.len().await, 1);

        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_refresh_claim_is_exclusive() {
        let (_, _, cache) = setup();
        assert!(cache.begin_refresh("k"));
        assert!(!cache.begin_refresh("k"));
        cache.finish_refresh("k");
        assert!(cache.begin_refresh("k"));
    }

    #[test]
    fn test_entry_age_display() {
        let now = Utc::now();
        let ttl = chrono::Duration::hours(48);
        let entry = CacheEntry::new((), now, ttl, 1).unwrap();
        assert_eq!(entry.age_display(now), "just now");
        assert_eq!(entry.age_display(now + chrono::Duration::minutes(5)), "5m ago");
        assert_eq!(entry.age_display(now + chrono::Duration::minutes(95)), "2h ago");
        assert_eq!(entry.age_display(now + chrono::Duration::hours(25)), "1d ago");
        // clock skew
        assert_eq!(entry.age_display(now - chrono::Duration::minutes(5)), "just now");
    }

    #[test]
    fn test_entry_round_trips_with_camel_case_fields() {
        let now = Utc::now();
        let entry = CacheEntry::new(json!({"x": 1}), now, chrono::Duration::seconds(10), 1).unwrap();
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("expiresAt").is_some());
        let back: CacheEntry<Value> = serde_json::from_value(json).unwrap();
        assert_eq!(back.expires_at, entry.expires_at);
        assert_eq!(back.version, 1);
    }
}
