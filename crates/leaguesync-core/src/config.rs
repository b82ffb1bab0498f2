//! Engine configuration.
//!
//! Configuration is stored at `~/.config/leaguesync/config.json`. Every field has a
//! default, so a missing or partial file is fine. A few values can be overridden
//! from the environment (after `.env` is loaded by the binary):
//!
//! - `LEAGUESYNC_REMOTE_URL`
//! - `LEAGUESYNC_API_KEY`
//! - `LEAGUESYNC_DATA_DIR`

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Application name used for config/data directory paths
const APP_NAME: &str = "leaguesync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Operations pulled from the queue per batch.
const DEFAULT_BATCH_SIZE: usize = 10;

/// Pause between batches so a large backlog does not hammer the backend.
const DEFAULT_BATCH_DELAY_MS: u64 = 100;

/// First retry waits this long; each further retry doubles it.
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;

/// Upper bound on a single backoff delay (5 minutes).
const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 5 * 60 * 1000;

const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default cache TTL (5 minutes).
const DEFAULT_CACHE_TTL_MS: u64 = 5 * 60 * 1000;

/// Entries within this window of expiry are served but flagged stale (1 minute).
const DEFAULT_STALE_WINDOW_MS: u64 = 60 * 1000;

/// Bump when the shape of cached data changes; older entries are dropped on load.
pub const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub remote_url: Option<String>,
    pub api_key: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub sync: SyncConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub retry_base_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub max_retries: u32,
    /// Fail permanent remote errors (validation, constraint) immediately instead of
    /// spending the retry budget on them.
    pub fail_fast_on_permanent: bool,
    /// Periodic background sync while online. `None` disables it.
    pub auto_sync_interval_ms: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay_ms: DEFAULT_BATCH_DELAY_MS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_retry_delay_ms: DEFAULT_MAX_RETRY_DELAY_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            fail_fast_on_permanent: false,
            auto_sync_interval_ms: None,
        }
    }
}

impl SyncConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Backoff before the next attempt of an operation that has already failed
    /// `retry_count` times: `base * 2^retry_count`, capped at `max_retry_delay_ms`.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let ms = self
            .retry_base_delay_ms
            .saturating_mul(factor)
            .min(self.max_retry_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn auto_sync_interval(&self) -> Option<Duration> {
        self.auto_sync_interval_ms.map(Duration::from_millis)
    }

    /// `max_retries`, but never below one attempt per operation.
    pub fn retry_budget(&self) -> u32 {
        self.max_retries.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_ms: u64,
    pub stale_window_ms: u64,
    pub version: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: DEFAULT_CACHE_TTL_MS,
            stale_window_ms: DEFAULT_STALE_WINDOW_MS,
            version: CACHE_FORMAT_VERSION,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn stale_window(&self) -> Duration {
        Duration::from_millis(self.stale_window_ms)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Self::default()
        };
        config.sync.max_retries = config.sync.retry_budget();
        config.apply_env();
        Ok(config)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Overlay environment variables onto the file-based values.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("LEAGUESYNC_REMOTE_URL").filter(|v| !v.is_empty()) {
            self.remote_url = Some(url);
        }
        if let Some(key) = lookup("LEAGUESYNC_API_KEY").filter(|v| !v.is_empty()) {
            self.api_key = Some(key);
        }
        if let Some(dir) = lookup("LEAGUESYNC_DATA_DIR").filter(|v| !v.is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    /// Directory holding the persisted queue and cache.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }
}
