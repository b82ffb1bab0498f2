use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::operation::{OperationStatus, SyncOperation};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::{validate_payload, OperationKind, Table};
use crate::storage::{load_json, save_json, Storage, QUEUE_KEY};

/// Result of `SyncQueue::add`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new operation was queued with this id.
    Queued(String),
    /// An equivalent operation is already outstanding; nothing was queued.
    Duplicate(String),
}

impl AddOutcome {
    pub fn id(&self) -> &str {
        match self {
            AddOutcome::Queued(id) | AddOutcome::Duplicate(id) => id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AddOutcome::Duplicate(_))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub pending: usize,
    pub syncing: usize,
    pub failed: usize,
    pub completed: usize,
    pub total: usize,
    pub oldest_pending: Option<DateTime<Utc>>,
}

/// The pending-mutation queue.
///
/// Not internally synchronized: the sync service owns it behind a single lock
/// so that read-decide-mutate-persist sequences are atomic.
pub struct SyncQueue {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    operations: Vec<SyncOperation>,
}

impl SyncQueue {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>, max_retries: u32) -> Self {
        Self {
            storage,
            clock,
            // Every operation gets at least one attempt.
            max_retries: max_retries.max(1),
            operations: Vec::new(),
        }
    }

    /// Replace the in-memory queue with the persisted one.
    ///
    /// Completed operations are discarded. Everything else, including `syncing`
    /// leftovers from a crash, is kept as-is; see `recover_interrupted`.
    pub async fn load(&mut self) -> Result<usize> {
        let stored: Vec<SyncOperation> = load_json(self.storage.as_ref(), QUEUE_KEY)
            .await?
            .unwrap_or_default();
        let total = stored.len();
        self.operations = stored
            .into_iter()
            .filter(|op| op.status != OperationStatus::Completed)
            .collect();
        let kept = self.operations.len();
        if kept != total {
            debug!(kept, dropped = total - kept, "Discarded completed operations on load");
            self.persist().await;
        }
        Ok(kept)
    }

    async fn persist(&self) {
        if let Err(e) = save_json(self.storage.as_ref(), QUEUE_KEY, &self.operations).await {
            warn!(error = %e, "Failed to persist sync queue");
        }
    }

    /// Queue a mutation. The payload is validated first; an equivalent outstanding
    /// operation (same table, operation, and reference id) makes this a no-op.
    pub async fn add(
        &mut self,
        table: Table,
        operation: OperationKind,
        data: Value,
        reference_id: Option<String>,
    ) -> Result<AddOutcome> {
        validate_payload(table, operation, &data)?;

        if let Some(existing) = self.find_duplicate(table, operation, reference_id.as_deref()) {
            debug!(
                op_id = %existing.id,
                table = %table,
                operation = %operation,
                "Duplicate operation discarded"
            );
            return Ok(AddOutcome::Duplicate(existing.id.clone()));
        }

        let op = SyncOperation::new(
            table,
            operation,
            data,
            reference_id,
            self.max_retries,
            self.clock.now(),
        );
        let id = op.id.clone();
        debug!(op_id = %id, label = %op.label(), priority = op.priority(), "Operation queued");
        self.operations.push(op);
        self.persist().await;
        Ok(AddOutcome::Queued(id))
    }

    /// Move an operation to `status`. Only transitions allowed by
    /// `OperationStatus::can_transition_to` are accepted.
    pub async fn update_status(
        &mut self,
        id: &str,
        status: OperationStatus,
        error: Option<String>,
    ) -> Result<()> {
        let op = self.find_mut(id)?;
        if !op.status.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: op.status,
                to: status,
            });
        }
        op.status = status;
        if status == OperationStatus::Completed {
            op.error = None;
        } else if error.is_some() {
            op.error = error;
        }
        self.persist().await;
        Ok(())
    }

    /// Record a failed attempt. Returns whether the operation may be retried.
    ///
    /// When the retry counter reaches `max_retries` the operation is marked
    /// `failed` in the same call; otherwise an in-flight operation goes back to
    /// `pending`.
    pub async fn increment_retry(&mut self, id: &str, error: Option<String>) -> Result<bool> {
        let op = self.find_mut(id)?;
        op.retry_count = op.retry_count.saturating_add(1);
        if error.is_some() {
            op.error = error;
        }

        let can_retry = op.retry_count < op.max_retries;
        if can_retry {
            if op.status == OperationStatus::Syncing {
                op.status = OperationStatus::Pending;
            }
        } else {
            op.status = OperationStatus::Failed;
            error!(
                op_id = %op.id,
                label = %op.label(),
                retries = op.retry_count,
                error = op.error.as_deref().unwrap_or(""),
                "Operation failed permanently"
            );
        }
        self.persist().await;
        Ok(can_retry)
    }

    pub async fn remove(&mut self, id: &str) -> bool {
        let before = self.operations.len();
        self.operations.retain(|op| op.id != id);
        let removed = self.operations.len() != before;
        if removed {
            self.persist().await;
        }
        removed
    }

    /// Remove `id` only while it is still `pending`.
    pub async fn remove_if_pending(&mut self, id: &str) -> bool {
        match self.get(id) {
            Some(op) if op.status == OperationStatus::Pending => self.remove(id).await,
            _ => false,
        }
    }

    pub async fn clear_completed(&mut self) -> usize {
        let before = self.operations.len();
        self.operations
            .retain(|op| op.status != OperationStatus::Completed);
        let removed = before - self.operations.len();
        if removed > 0 {
            self.persist().await;
        }
        removed
    }

    /// Reset every `failed` operation to `pending` with a fresh retry budget.
    pub async fn reset_failed(&mut self) -> usize {
        let mut reset = 0;
        for op in self
            .operations
            .iter_mut()
            .filter(|op| op.status == OperationStatus::Failed)
        {
            op.status = OperationStatus::Pending;
            op.retry_count = 0;
            op.error = None;
            reset += 1;
        }
        if reset > 0 {
            self.persist().await;
        }
        reset
    }

    /// Put operations left `syncing` by an interrupted process back to `pending`.
    ///
    /// There is no way to know whether their remote call landed, so they will be
    /// sent again.
    pub async fn recover_interrupted(&mut self) -> usize {
        let mut recovered = 0;
        for op in self
            .operations
            .iter_mut()
            .filter(|op| op.status == OperationStatus::Syncing)
        {
            warn!(op_id = %op.id, label = %op.label(), "Replaying operation interrupted mid-sync");
            op.status = OperationStatus::Pending;
            recovered += 1;
        }
        if recovered > 0 {
            self.persist().await;
        }
        recovered
    }

    /// Pending operations by ascending priority, then oldest first.
    pub fn get_pending(&self) -> Vec<SyncOperation> {
        let mut pending: Vec<SyncOperation> = self
            .operations
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        pending.sort_by_key(|op| (op.priority(), op.timestamp));
        pending
    }

    /// At most `n` pending operations, in send order.
    pub fn get_next_batch(&self, n: usize) -> Vec<SyncOperation> {
        self.next_batch_excluding(n, &HashSet::new())
    }

    /// Like `get_next_batch`, skipping ids in `exclude`.
    pub fn next_batch_excluding(&self, n: usize, exclude: &HashSet<String>) -> Vec<SyncOperation> {
        self.get_pending()
            .into_iter()
            .filter(|op| !exclude.contains(&op.id))
            .take(n)
            .collect()
    }

    pub fn get_failed(&self) -> Vec<SyncOperation> {
        self.operations
            .iter()
            .filter(|op| op.status == OperationStatus::Failed)
            .cloned()
            .collect()
    }

    /// True iff an operation with this exact (table, operation, reference id) is
    /// pending or syncing. Without a reference id nothing counts as a duplicate.
    pub fn is_duplicate(
        &self,
        table: Table,
        operation: OperationKind,
        reference_id: Option<&str>,
    ) -> bool {
        self.find_duplicate(table, operation, reference_id).is_some()
    }

    fn find_duplicate(
        &self,
        table: Table,
        operation: OperationKind,
        reference_id: Option<&str>,
    ) -> Option<&SyncOperation> {
        self.operations.iter().find(|op| {
            op.status.is_outstanding() && op.same_intent(table, operation, reference_id)
        })
    }

    pub fn summary(&self) -> QueueSummary {
        let mut summary = QueueSummary {
            total: self.operations.len(),
            ..QueueSummary::default()
        };
        for op in &self.operations {
            match op.status {
                OperationStatus::Pending => {
                    summary.pending += 1;
                    summary.oldest_pending = Some(match summary.oldest_pending {
                        Some(oldest) => oldest.min(op.timestamp),
                        None => op.timestamp,
                    });
                }
                OperationStatus::Syncing => summary.syncing += 1,
                OperationStatus::Failed => summary.failed += 1,
                OperationStatus::Completed => summary.completed += 1,
            }
        }
        summary
    }

    pub fn get(&self, id: &str) -> Option<&SyncOperation> {
        self.operations.iter().find(|op| op.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Result<&mut SyncOperation> {
        self.operations
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))
    }

    /// Every operation, in insertion order.
    pub fn all(&self) -> &[SyncOperation] {
        &self.operations
    }

    pub fn has_pending(&self) -> bool {
        self.operations
            .iter()
            .any(|op| op.status == OperationStatus::Pending)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
