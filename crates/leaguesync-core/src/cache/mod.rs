//! Local caching module for offline reads.
//!
//! This module provides the `CacheManager`, a TTL cache with
//! stale-while-revalidate semantics. Entries are kept in memory and written
//! through to durable storage so they survive restarts.
//!
//! Cache keys follow a `table:...` scheme built by the helpers in `keys`, which
//! lets one mutation invalidate a whole family of derived listings by prefix.

pub mod keys;
pub mod manager;

pub use manager::{CacheEntry, CacheManager, CacheStats, Cached};
