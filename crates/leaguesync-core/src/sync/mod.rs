//! Sync orchestration: connectivity, queue draining, retry, and invalidation.

pub mod events;
pub mod invalidation;
pub mod network;
pub mod service;

pub use events::{EventBus, ListenerHandle, SyncEvent};
pub use network::NetworkState;
pub use service::{QueueOptions, ServiceStatus, SyncReport, SyncService};
