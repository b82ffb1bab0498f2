//! Durable queue of local mutations waiting to reach the remote store.
//!
//! Every change to the queue is written through to storage before the call
//! returns, so a crash can lose at most the operation that was mid-flight.
//! Operations leave in priority order (see `operation::priority`), FIFO within
//! a priority tier.

pub mod operation;
pub mod sync_queue;

pub use operation::{priority, OperationStatus, SyncOperation, DEFAULT_PRIORITY};
pub use sync_queue::{AddOutcome, QueueSummary, SyncQueue};
