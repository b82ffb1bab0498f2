//! Offline cache and sync-queue engine for the league app.
//!
//! The engine keeps the client usable while disconnected:
//!
//! - `CacheManager`: TTL read cache with stale-while-revalidate, persisted across restarts
//! - `SyncQueue`: durable, priority-ordered list of pending mutations
//! - `SyncService`: drains the queue against the remote store when online, with
//!   retry/backoff and cache invalidation on success
//! - Entity services (`ProfileService`, `ChallengeService`, `ActivityService`): read
//!   through the cache, write through the sync service
//!
//! Storage, clock, and remote store are injected, so every piece can run against
//! in-memory doubles in tests.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod queue;
pub mod remote;
pub mod services;
pub mod storage;
pub mod sync;

pub use cache::{CacheManager, CacheStats, Cached};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, Config, SyncConfig};
pub use error::{Error, Result};
pub use models::{OperationKind, Table};
pub use queue::{AddOutcome, OperationStatus, QueueSummary, SyncOperation, SyncQueue};
pub use remote::{ListQuery, RemoteError, RemoteStore, RestRemoteStore};
pub use services::{ActivityService, ChallengeService, ProfileService};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
pub use sync::{
    ListenerHandle, NetworkState, QueueOptions, ServiceStatus, SyncEvent, SyncReport, SyncService,
};
